use image::DynamicImage;
use indexmap::IndexMap;
use serde_json::Value;

/// Whatever the remote service handed back, sorted into the shapes the
/// normalizer knows how to probe.
#[derive(Debug, Clone)]
pub enum RemoteResult {
    Sequence(Vec<RemoteResult>),
    Mapping(IndexMap<String, RemoteResult>),
    Text(String),
    /// Already decoded; needs no file read or fetch.
    Image(DynamicImage),
    Unrecognized(Value),
}

impl RemoteResult {
    /// Converts an untrusted JSON payload. Strings stay text, including
    /// inline `data:` payloads; only a `DynamicImage` conversion
    /// yields [`RemoteResult::Image`].
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(rows) => Self::Sequence(rows.into_iter().map(Self::from_value).collect()),
            Value::Object(fields) => Self::Mapping(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Self::from_value(value)))
                    .collect(),
            ),
            Value::String(text) => Self::Text(text),
            other => Self::Unrecognized(other),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}

impl From<Value> for RemoteResult {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl From<DynamicImage> for RemoteResult {
    fn from(image: DynamicImage) -> Self {
        Self::Image(image)
    }
}
