use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Builds the JSON receipt written next to each gateway call's artifacts.
/// Image payloads are stripped before anything touches disk; the digest
/// still ties the receipt to the exact request that was sent.
pub fn build_receipt(
    action: &str,
    request_digest: &str,
    request: &Value,
    response_summary: &Value,
    artifact_path: Option<&Path>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert("action".to_string(), Value::String(action.to_string()));
    root.insert(
        "request_digest".to_string(),
        Value::String(request_digest.to_string()),
    );
    root.insert("request".to_string(), sanitize_payload(request));
    root.insert("response".to_string(), sanitize_payload(response_summary));
    root.insert(
        "artifact_path".to_string(),
        artifact_path
            .map(|path| Value::String(path.to_string_lossy().to_string()))
            .unwrap_or(Value::Null),
    );
    root.insert("ts".to_string(), Value::String(now_utc_iso()));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Totals for one studio session, written once on finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub renders: u64,
    pub adjustments: u64,
    pub estimates: u64,
    pub exports: u64,
}

pub fn write_summary(path: &Path, summary: &SessionSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "data" | "encoded_bytes" | "encodedbytes" | "b64_json" | "image_bytes"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{build_receipt, write_receipt, write_summary, SessionSummary, RECEIPT_SCHEMA_VERSION};

    #[test]
    fn receipts_omit_image_payloads_but_keep_structure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipt-1.json");
        let artifact_path = temp.path().join("render-1.png");

        let request = json!({
            "model": "gemini-2.5-flash-image-preview",
            "parts": [
                { "inlineData": { "mimeType": "image/png", "data": "aGVsbG8=" } },
                { "text": "redesign the room" },
            ],
        });
        let response = json!({ "candidates": 1 });
        let payload = build_receipt(
            "generate",
            "abcd1234",
            &request,
            &response,
            Some(&artifact_path),
        );
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["action"], json!("generate"));
        assert_eq!(parsed["request_digest"], json!("abcd1234"));
        assert_eq!(
            parsed["request"]["parts"][0]["inlineData"]["data"],
            json!("<omitted>")
        );
        assert_eq!(
            parsed["request"]["parts"][1]["text"],
            json!("redesign the room")
        );
        assert_eq!(parsed["response"]["candidates"], json!(1));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }

    #[test]
    fn summary_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");
        let summary = SessionSummary {
            session_id: "session-9".to_string(),
            started_at: "2026-08-08T00:00:00+00:00".to_string(),
            finished_at: "2026-08-08T00:05:00+00:00".to_string(),
            renders: 2,
            adjustments: 1,
            estimates: 1,
            exports: 1,
        };
        write_summary(&path, &summary)?;
        let parsed: SessionSummary =
            serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed, summary);
        Ok(())
    }
}
