use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use vibegen_contracts::request::GenerationRequest;

use crate::config::EngineConfig;
use crate::source::is_network_address;
use crate::{truncate_text, InferenceClient};

const FILE_DATA_TYPE: &str = "gradio.FileData";

/// What `/config` says about how the server wants to be called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Route prefix, e.g. `/gradio_api` on Gradio 5; empty before that.
    pub api_prefix: String,
    /// Gradio 3.x: no `/call` route, predictions go to `/run/<api>`.
    pub legacy: bool,
}

impl ServerInfo {
    pub fn from_config(config: &Value) -> Self {
        let api_prefix = config
            .get("api_prefix")
            .and_then(Value::as_str)
            .map(|prefix| prefix.trim().trim_matches('/'))
            .filter(|prefix| !prefix.is_empty())
            .map(|prefix| format!("/{prefix}"))
            .unwrap_or_default();
        let legacy = config
            .get("version")
            .and_then(Value::as_str)
            .and_then(|version| version.trim().split('.').next())
            .and_then(|major| major.parse::<u32>().ok())
            .map(|major| major < 4)
            .unwrap_or(false);
        Self { api_prefix, legacy }
    }

    /// Base for API routes and `file=` URLs.
    pub fn base_url(&self, root: &str) -> String {
        format!("{root}{}", self.api_prefix)
    }
}

/// Gradio HTTP client. Reads `/config` first, then either submits to
/// `/call/<api>` and reads the server-sent event stream for that event id,
/// or on 3.x servers posts once to `/run/<api>`.
pub struct GradioClient {
    root: String,
    api_name: String,
    http: HttpClient,
    request_timeout: Duration,
}

impl GradioClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            root: config.endpoint_root(),
            api_name: config.api_name.trim().trim_start_matches('/').to_string(),
            http: HttpClient::new(),
            request_timeout: config.request_timeout,
        }
    }

    fn server_info(&self) -> Result<ServerInfo> {
        let url = format!("{}/config", self.root);
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("Gradio config request failed ({url})"))?;
        let config = response_json_or_error("Gradio config", response)?;
        Ok(ServerInfo::from_config(&config))
    }

    fn call_endpoint(&self, server: &ServerInfo) -> String {
        format!("{}/call/{}", server.base_url(&self.root), self.api_name)
    }

    fn submit(&self, server: &ServerInfo, request: &GenerationRequest) -> Result<String> {
        let endpoint = self.call_endpoint(server);
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.request_timeout)
            .json(&request_payload(request))
            .send()
            .with_context(|| format!("Gradio submit request failed ({endpoint})"))?;
        let body = response_json_or_error("Gradio submit", response)?;
        body.get("event_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow!(
                    "Gradio submit response missing event_id: {}",
                    truncate_text(&body.to_string(), 512)
                )
            })
    }

    fn await_result(&self, server: &ServerInfo, event_id: &str) -> Result<Value> {
        let url = format!("{}/{event_id}", self.call_endpoint(server));
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("Gradio result stream request failed ({url})"))?;
        let status = response.status();
        let body = response
            .text()
            .context("Gradio result stream read failed")?;
        if !status.is_success() {
            bail!(
                "Gradio result stream failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        parse_event_stream(&body)
    }

    fn run_legacy(&self, server: &ServerInfo, request: &GenerationRequest) -> Result<Value> {
        let endpoint = format!("{}/run/{}", server.base_url(&self.root), self.api_name);
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.request_timeout)
            .json(&request_payload(request))
            .send()
            .with_context(|| format!("Gradio run request failed ({endpoint})"))?;
        let mut body = response_json_or_error("Gradio run", response)?;
        match body.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => bail!(
                "Gradio run response missing data: {}",
                truncate_text(&body.to_string(), 512)
            ),
        }
    }
}

impl InferenceClient for GradioClient {
    fn name(&self) -> &str {
        "gradio"
    }

    fn predict(&self, request: &GenerationRequest) -> Result<Value> {
        let server = self.server_info()?;
        let outputs = if server.legacy {
            tracing::debug!(root = %self.root, "Gradio 3.x server; using /run route");
            self.run_legacy(&server, request)?
        } else {
            let event_id = self.submit(&server, request)?;
            tracing::debug!(event_id = %event_id, root = %self.root, "Gradio prediction submitted");
            self.await_result(&server, &event_id)?
        };
        Ok(materialize_file_refs(
            unwrap_single_output(outputs),
            &server.base_url(&self.root),
        ))
    }
}

fn request_payload(request: &GenerationRequest) -> Value {
    json!({
        "data": [
            request.prompt,
            request.negative_prompt,
            request.guidance_scale,
        ]
    })
}

/// `owner/name` → `https://owner-name.hf.space`. Full URLs pass through.
pub fn space_root_url(space: &str) -> String {
    let trimmed = space.trim().trim_end_matches('/');
    if is_network_address(trimmed) {
        return trimmed.to_string();
    }
    let subdomain: String = trimmed
        .chars()
        .map(|ch| match ch {
            '/' | '_' | '.' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    format!("https://{subdomain}.hf.space")
}

/// Returns the `data` of the `complete` event. An `error` event, or a stream
/// that ends without either, is a failure.
pub fn parse_event_stream(body: &str) -> Result<Value> {
    let mut event: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            let payload = data.join("\n");
            match event.take() {
                Some("complete") => {
                    return serde_json::from_str(&payload)
                        .context("Gradio complete event carried invalid JSON");
                }
                Some("error") => {
                    let detail = payload.trim();
                    if detail.is_empty() || detail == "null" {
                        bail!("Gradio prediction failed without details");
                    }
                    bail!("Gradio prediction failed: {}", truncate_text(detail, 512));
                }
                _ => {}
            }
            data.clear();
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    bail!("Gradio event stream ended without a result")
}

/// Endpoints with a single output component hand back that output directly.
fn unwrap_single_output(outputs: Value) -> Value {
    match outputs {
        Value::Array(mut rows) if rows.len() == 1 => rows.remove(0),
        other => other,
    }
}

/// Replaces Gradio file descriptors with their URL text so they become
/// candidate references for the normalizer. `base` is the server root plus
/// its API prefix; relative paths become `{base}/file={path}`.
pub fn materialize_file_refs(value: Value, base: &str) -> Value {
    match value {
        Value::Array(rows) => Value::Array(
            rows.into_iter()
                .map(|row| materialize_file_refs(row, base))
                .collect(),
        ),
        Value::Object(fields) => {
            if let Some(reference) = file_reference(&fields, base) {
                return Value::String(reference);
            }
            Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, materialize_file_refs(value, base)))
                    .collect(),
            )
        }
        other => other,
    }
}

fn file_reference(fields: &Map<String, Value>, base: &str) -> Option<String> {
    let non_empty = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let tagged = fields
        .get("meta")
        .and_then(|meta| meta.get("_type"))
        .and_then(Value::as_str)
        == Some(FILE_DATA_TYPE);
    let path = if tagged || (fields.contains_key("path") && fields.contains_key("url")) {
        if let Some(url) = non_empty("url") {
            return Some(url.to_string());
        }
        non_empty("path")?
    } else if fields.get("is_file").and_then(Value::as_bool) == Some(true) {
        // Gradio 3.x: `{"name": "/tmp/...", "is_file": true}`
        non_empty("name")?
    } else {
        return None;
    };
    if is_network_address(path) {
        return Some(path.to_string());
    }
    Some(format!("{base}/file={path}"))
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}
