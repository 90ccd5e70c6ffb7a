use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::request::GenerationRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub request: GenerationRequest,
    pub outcome: String,
    pub image_path: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fingerprint: Option<String>,
    pub diagnostics: Vec<String>,
}

pub fn write_summary(path: &Path, summary: &GenerationSummary) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> GenerationSummary {
        GenerationSummary {
            run_id: "run-1".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: "2026-01-01T00:00:05Z".to_string(),
            request: GenerationRequest::new("boat"),
            outcome: "image".to_string(),
            image_path: Some("/tmp/out.png".to_string()),
            width: Some(512),
            height: Some(512),
            fingerprint: Some("abcd".to_string()),
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn summary_round_trips_with_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out").join("summary.json");

        write_summary(&path, &summary())?;

        let raw = std::fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&raw)?;
        assert!(value["ts"].as_str().is_some());
        let parsed: GenerationSummary = serde_json::from_value(value)?;
        assert_eq!(parsed, summary());
        Ok(())
    }
}
