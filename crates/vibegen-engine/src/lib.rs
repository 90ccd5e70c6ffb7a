pub mod config;
pub mod gradio;
pub mod normalizer;
pub mod result;
pub mod source;

use anyhow::Result;
use image::DynamicImage;
use serde_json::Value;
use vibegen_contracts::events::{EventLog, GenerationEvent};
use vibegen_contracts::request::GenerationRequest;

pub use config::EngineConfig;
pub use gradio::GradioClient;
pub use normalizer::{
    CandidateFailure, Diagnostic, DiagnosticKind, ImageOrigin, Normalizer, Resolution,
    ResolvedImage,
};
pub use result::RemoteResult;
pub use source::{ImageSource, SystemImageSource};

/// The remote inference collaborator. One blocking call per submission.
pub trait InferenceClient: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, request: &GenerationRequest) -> Result<Value>;
}

impl<T: InferenceClient + ?Sized> InferenceClient for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn predict(&self, request: &GenerationRequest) -> Result<Value> {
        (**self).predict(request)
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    /// The request as sent, after guidance-scale normalization.
    pub request: GenerationRequest,
    pub image: Option<ResolvedImage>,
    pub diagnostics: Vec<Diagnostic>,
    pub warnings: Vec<String>,
}

impl Generation {
    pub fn image(&self) -> Option<&DynamicImage> {
        self.image.as_ref().map(|resolved| &resolved.image)
    }

    pub fn into_image(self) -> Option<DynamicImage> {
        self.image.map(|resolved| resolved.image)
    }
}

/// Prompt in, image (or nothing) out.
///
/// `generate` never returns an error: a blank prompt, a failed prediction
/// and an unresolvable result all come back as a [`Generation`] without an
/// image and with diagnostics saying why.
pub struct ImageGenerator<C, S> {
    client: C,
    normalizer: Normalizer<S>,
    events: Option<EventLog>,
}

impl<C: InferenceClient, S: ImageSource> ImageGenerator<C, S> {
    pub fn new(client: C, source: S) -> Self {
        Self {
            client,
            normalizer: Normalizer::new(source),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn generate(&self, request: &GenerationRequest) -> Generation {
        if !request.has_prompt() {
            tracing::info!("empty prompt; skipping remote generation");
            self.emit(GenerationEvent::GenerationSkipped {
                reason: "empty prompt".to_string(),
            });
            return Generation {
                request: request.clone(),
                image: None,
                diagnostics: vec![Diagnostic::new(
                    DiagnosticKind::EmptyPrompt,
                    None,
                    "prompt is empty after trimming",
                )],
                warnings: Vec::new(),
            };
        }

        let mut warnings = Vec::new();
        let request = request.normalized(&mut warnings);
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        self.emit(GenerationEvent::GenerationRequested {
            client: self.client.name().to_string(),
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            guidance_scale: request.guidance_scale,
            warnings: warnings.clone(),
        });

        let raw = match self.client.predict(&request) {
            Ok(raw) => raw,
            Err(err) => {
                let error = error_chain_text(&err, 1024);
                tracing::warn!(client = self.client.name(), error = %error, "prediction failed");
                self.emit(GenerationEvent::PredictionFailed {
                    client: self.client.name().to_string(),
                    error: error.clone(),
                });
                self.emit(GenerationEvent::ImageMissing { diagnostics: 1 });
                return Generation {
                    request,
                    image: None,
                    diagnostics: vec![Diagnostic::new(
                        DiagnosticKind::PredictionFailure,
                        None,
                        error,
                    )],
                    warnings,
                };
            }
        };

        let result = RemoteResult::from_value(raw);
        tracing::debug!(shape = result.shape(), "remote result received");
        self.emit(GenerationEvent::PredictionReceived {
            client: self.client.name().to_string(),
            shape: result.shape().to_string(),
        });

        let Resolution { image, diagnostics } = self.normalizer.resolve_image(&result);
        for note in &diagnostics {
            if matches!(
                note.kind,
                DiagnosticKind::ShapeMismatch | DiagnosticKind::CandidateResolutionFailure
            ) {
                self.emit(GenerationEvent::CandidateFailed {
                    entry: note.entry,
                    kind: note.kind.as_str().to_string(),
                    message: note.message.clone(),
                });
            }
        }
        match &image {
            Some(resolved) => self.emit(GenerationEvent::ImageResolved {
                origin: resolved.origin.to_string(),
                width: resolved.image.width(),
                height: resolved.image.height(),
                fingerprint: resolved.fingerprint(),
            }),
            None => self.emit(GenerationEvent::ImageMissing {
                diagnostics: diagnostics.len(),
            }),
        }

        Generation {
            request,
            image,
            diagnostics,
            warnings,
        }
    }

    fn emit(&self, event: GenerationEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.record(&event) {
            tracing::warn!(
                event = event.kind(),
                path = %events.path().display(),
                error = %format!("{err:#}"),
                "failed to append run event"
            );
        }
    }
}

/// One-shot generation against the endpoint configured in the environment.
pub fn generate_image(
    prompt: &str,
    negative_prompt: &str,
    guidance_scale: f64,
) -> Option<DynamicImage> {
    let config = EngineConfig::from_env();
    let generator = ImageGenerator::new(
        GradioClient::new(&config),
        SystemImageSource::new(config.download_timeout),
    );
    let request = GenerationRequest::new(prompt)
        .with_negative_prompt(negative_prompt)
        .with_guidance_scale(guidance_scale);
    generator.generate(&request).into_image()
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
