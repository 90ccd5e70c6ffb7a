use std::env;
use std::time::Duration;

use crate::gradio::space_root_url;

pub const DEFAULT_SPACE: &str = "stabilityai/stable-diffusion";
pub const DEFAULT_API_NAME: &str = "/infer";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Hosted space identifier, `owner/name`.
    pub space: String,
    pub api_name: String,
    /// Explicit endpoint root; wins over the space-derived URL.
    pub gradio_url: Option<String>,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            space: DEFAULT_SPACE.to_string(),
            api_name: DEFAULT_API_NAME.to_string(),
            gradio_url: None,
            request_timeout: Duration::from_secs(300),
            download_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let seconds = |key: &str, default: f64, min: f64, max: f64| {
            let value = non_empty(key)
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .unwrap_or(default)
                .clamp(min, max);
            Duration::from_secs_f64(value)
        };

        let defaults = Self::default();
        Self {
            space: non_empty("VIBEGEN_SPACE").unwrap_or(defaults.space),
            api_name: non_empty("VIBEGEN_API_NAME").unwrap_or(defaults.api_name),
            gradio_url: non_empty("VIBEGEN_GRADIO_URL")
                .map(|value| value.trim_end_matches('/').to_string()),
            request_timeout: seconds("VIBEGEN_REQUEST_TIMEOUT", 300.0, 10.0, 900.0),
            download_timeout: seconds("VIBEGEN_DOWNLOAD_TIMEOUT", 60.0, 5.0, 300.0),
        }
    }

    pub fn endpoint_root(&self) -> String {
        match &self.gradio_url {
            Some(url) => url.clone(),
            None => space_root_url(&self.space),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(config_from(&[]), EngineConfig::default());
        assert_eq!(
            EngineConfig::default().endpoint_root(),
            "https://stabilityai-stable-diffusion.hf.space"
        );
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = config_from(&[("VIBEGEN_SPACE", "   "), ("VIBEGEN_GRADIO_URL", "")]);
        assert_eq!(config.space, DEFAULT_SPACE);
        assert_eq!(config.gradio_url, None);
    }

    #[test]
    fn explicit_url_overrides_space() {
        let config = config_from(&[
            ("VIBEGEN_SPACE", "someone/other"),
            ("VIBEGEN_GRADIO_URL", "http://127.0.0.1:7860/"),
        ]);
        assert_eq!(config.endpoint_root(), "http://127.0.0.1:7860");
    }

    #[test]
    fn timeouts_are_parsed_and_clamped() {
        let config = config_from(&[
            ("VIBEGEN_REQUEST_TIMEOUT", "1"),
            ("VIBEGEN_DOWNLOAD_TIMEOUT", "12.5"),
        ]);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.download_timeout, Duration::from_secs_f64(12.5));

        let config = config_from(&[("VIBEGEN_REQUEST_TIMEOUT", "soon")]);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
    }
}
