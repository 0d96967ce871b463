use serde::{Deserialize, Serialize};

/// Media types the studio accepts for upload.
pub const ACCEPTED_MEDIA_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

/// Advisory upload ceiling, enforced at ingestion.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Transport-friendly encoding of one image: raw bytes as base64 plus the
/// media type needed to interpret them. Immutable once created; choosing a
/// new file supersedes the reference rather than mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReference {
    pub media_type: String,
    pub encoded_bytes: String,
}

impl ImageReference {
    pub fn new(media_type: impl Into<String>, encoded_bytes: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            encoded_bytes: encoded_bytes.into(),
        }
    }

    /// Display handle usable immediately by a renderer.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.encoded_bytes)
    }

    /// Inverse of [`data_uri`](Self::data_uri). Returns `None` for anything
    /// that is not a well-formed base64 data URI.
    pub fn from_data_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("data:")?;
        let (header, encoded) = rest.split_once(',')?;
        let media_type = header.strip_suffix(";base64")?;
        if media_type.is_empty() || encoded.is_empty() {
            return None;
        }
        Some(Self::new(media_type, encoded))
    }
}

pub fn is_accepted_media_type(media_type: &str) -> bool {
    ACCEPTED_MEDIA_TYPES
        .iter()
        .any(|accepted| accepted.eq_ignore_ascii_case(media_type.trim()))
}

#[cfg(test)]
mod tests {
    use super::{is_accepted_media_type, ImageReference};

    #[test]
    fn data_uri_round_trips() {
        let reference = ImageReference::new("image/png", "aGVsbG8=");
        let uri = reference.data_uri();
        assert_eq!(uri, "data:image/png;base64,aGVsbG8=");
        assert_eq!(ImageReference::from_data_uri(&uri), Some(reference));
    }

    #[test]
    fn malformed_data_uris_are_rejected() {
        assert!(ImageReference::from_data_uri("data:image/png,plain").is_none());
        assert!(ImageReference::from_data_uri("image/png;base64,aGk=").is_none());
        assert!(ImageReference::from_data_uri("data:;base64,aGk=").is_none());
    }

    #[test]
    fn accepted_media_types_cover_the_upload_set() {
        assert!(is_accepted_media_type("image/png"));
        assert!(is_accepted_media_type("image/jpeg"));
        assert!(is_accepted_media_type("image/webp"));
        assert!(!is_accepted_media_type("image/gif"));
        assert!(!is_accepted_media_type("application/pdf"));
    }
}
