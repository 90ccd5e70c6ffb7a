use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Everything a generation run reports to its event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    GenerationRequested {
        client: String,
        prompt: String,
        negative_prompt: String,
        guidance_scale: f64,
        warnings: Vec<String>,
    },
    GenerationSkipped {
        reason: String,
    },
    PredictionFailed {
        client: String,
        error: String,
    },
    PredictionReceived {
        client: String,
        shape: String,
    },
    CandidateFailed {
        entry: Option<usize>,
        kind: String,
        message: String,
    },
    ImageResolved {
        origin: String,
        width: u32,
        height: u32,
        fingerprint: String,
    },
    ImageMissing {
        diagnostics: usize,
    },
}

impl GenerationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GenerationRequested { .. } => "generation_requested",
            Self::GenerationSkipped { .. } => "generation_skipped",
            Self::PredictionFailed { .. } => "prediction_failed",
            Self::PredictionReceived { .. } => "prediction_received",
            Self::CandidateFailed { .. } => "candidate_failed",
            Self::ImageResolved { .. } => "image_resolved",
            Self::ImageMissing { .. } => "image_missing",
        }
    }
}

/// Append-only `events.jsonl` writer.
///
/// Each line is one compact JSON object carrying `type`, `run_id` and `ts`
/// next to the event's own fields.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn record(&self, event: &GenerationEvent) -> anyhow::Result<Value> {
        let mut line_obj = Map::new();
        line_obj.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        line_obj.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            line_obj.extend(fields);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&line_obj)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line_obj))
    }
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
