use thiserror::Error;

/// Failure taxonomy for the studio. Every variant carries the final
/// user-facing message; callers surface `to_string()` verbatim and retry is
/// always a manual re-invocation.
#[derive(Debug, Error)]
pub enum StudioError {
    /// Missing or malformed user input, caught before any network call.
    #[error("{0}")]
    Validation(String),
    /// The process was started without a usable backend credential.
    #[error("{0}")]
    Configuration(String),
    /// A selected image file could not be read.
    #[error("Failed to read image: {0}")]
    Ingestion(String),
    /// Design generation failed in transport, or the backend declined to
    /// return an image.
    #[error("Failed to generate design: {0}")]
    Generation(String),
    /// Design adjustment failed in transport, or the backend declined to
    /// return an image.
    #[error("Failed to adjust design: {0}")]
    Adjustment(String),
    /// Cost estimation failed in transport or returned an empty body.
    #[error("Failed to estimate cost: {0}")]
    Estimation(String),
    /// The backend returned cost data violating the declared response
    /// shape. Never coerced into a partial estimate.
    #[error("Cost estimate violated the response contract: {0}")]
    SchemaValidation(String),
    /// Report capture or document assembly failed. No partial file is left
    /// behind.
    #[error("Failed to export report: {0}")]
    Export(String),
}

impl StudioError {
    /// Stable lowercase tag for event payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StudioError::Validation(_) => "validation",
            StudioError::Configuration(_) => "configuration",
            StudioError::Ingestion(_) => "ingestion",
            StudioError::Generation(_) => "generation",
            StudioError::Adjustment(_) => "adjustment",
            StudioError::Estimation(_) => "estimation",
            StudioError::SchemaValidation(_) => "schema_validation",
            StudioError::Export(_) => "export",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StudioError;

    #[test]
    fn messages_are_preserved_verbatim() {
        let err = StudioError::Generation("backend said no".to_string());
        assert_eq!(err.to_string(), "Failed to generate design: backend said no");
        assert_eq!(err.kind(), "generation");
    }

    #[test]
    fn validation_surfaces_only_the_message() {
        let err = StudioError::Validation("Adjustment instructions cannot be empty.".to_string());
        assert_eq!(err.to_string(), "Adjustment instructions cannot be empty.");
    }
}
