use serde::{Deserialize, Serialize};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, ugly, duplicate";
pub const DEFAULT_GUIDANCE_SCALE: f64 = 9.0;
pub const GUIDANCE_SCALE_MIN: f64 = 1.0;
pub const GUIDANCE_SCALE_MAX: f64 = 20.0;
pub const GUIDANCE_SCALE_STEP: f64 = 0.5;

/// One user submission. Built per action and dropped once the image (or
/// its absence) has been handed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub guidance_scale: f64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    /// False when the prompt is empty after trimming; such requests never
    /// reach the remote service.
    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    /// Copy of the request with the guidance scale brought onto the slider
    /// grid. Adjustments are appended to `warnings`.
    pub fn normalized(&self, warnings: &mut Vec<String>) -> Self {
        Self {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            guidance_scale: normalize_guidance_scale(self.guidance_scale, warnings),
        }
    }
}

pub fn normalize_guidance_scale(raw: f64, warnings: &mut Vec<String>) -> f64 {
    if !raw.is_finite() {
        push_unique_warning(
            warnings,
            format!("guidance_scale {raw} is not a number; using {DEFAULT_GUIDANCE_SCALE}"),
        );
        return DEFAULT_GUIDANCE_SCALE;
    }
    let clamped = raw.clamp(GUIDANCE_SCALE_MIN, GUIDANCE_SCALE_MAX);
    let snapped = (clamped / GUIDANCE_SCALE_STEP).round() * GUIDANCE_SCALE_STEP;
    if snapped != raw {
        push_unique_warning(
            warnings,
            format!(
                "guidance_scale {raw} adjusted to {snapped} (range {GUIDANCE_SCALE_MIN}-{GUIDANCE_SCALE_MAX}, step {GUIDANCE_SCALE_STEP})"
            ),
        );
    }
    snapped
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExamplePrompt {
    pub prompt: &'static str,
    pub negative_prompt: &'static str,
    pub guidance_scale: f64,
}

impl ExamplePrompt {
    pub fn to_request(&self) -> GenerationRequest {
        GenerationRequest::new(self.prompt)
            .with_negative_prompt(self.negative_prompt)
            .with_guidance_scale(self.guidance_scale)
    }
}

pub const EXAMPLE_PROMPTS: [ExamplePrompt; 5] = [
    ExamplePrompt {
        prompt: "A magical forest with glowing mushrooms and fireflies, fantasy art style",
        negative_prompt: "blurry, low quality",
        guidance_scale: 9.0,
    },
    ExamplePrompt {
        prompt: "A futuristic cityscape at night with neon lights, cyberpunk style",
        negative_prompt: "daylight, vintage",
        guidance_scale: 12.0,
    },
    ExamplePrompt {
        prompt: "A cute robot pet sitting in a garden, digital art",
        negative_prompt: "scary, dark, realistic",
        guidance_scale: 8.0,
    },
    ExamplePrompt {
        prompt: "An astronaut riding a horse on Mars, cinematic lighting",
        negative_prompt: "cartoon, low resolution",
        guidance_scale: 10.0,
    },
    ExamplePrompt {
        prompt: "A steampunk airship flying through clouds, detailed illustration",
        negative_prompt: "modern, simple",
        guidance_scale: 11.0,
    },
];

/// 1-based lookup, matching how examples are numbered in the CLI listing.
pub fn example_prompt(number: usize) -> Option<&'static ExamplePrompt> {
    number
        .checked_sub(1)
        .and_then(|index| EXAMPLE_PROMPTS.get(index))
}
