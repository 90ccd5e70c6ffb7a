use std::fmt;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use sha2::{Digest, Sha256};

use crate::result::RemoteResult;
use crate::source::{is_network_address, ImageSource};
use crate::truncate_text;

const IMAGE_KEY: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    ShapeMismatch,
    CandidateResolutionFailure,
    TotalResolutionFailure,
    EmptyPrompt,
    PredictionFailure,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShapeMismatch => "shape_mismatch",
            Self::CandidateResolutionFailure => "candidate_resolution_failure",
            Self::TotalResolutionFailure => "total_resolution_failure",
            Self::EmptyPrompt => "empty_prompt",
            Self::PredictionFailure => "prediction_failure",
        }
    }
}

/// Operator-facing note explaining why something did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Index of the sequence entry the note is about, if any.
    pub entry: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, entry: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entry,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry {
            Some(entry) => write!(f, "{} (entry {entry}): {}", self.kind.as_str(), self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CandidateFailure {
    #[error("expected a text reference, found {0}")]
    NotAReference(&'static str),
    #[error("'{0}' is neither an existing file nor an http(s) address")]
    UnsupportedReference(String),
    #[error("'{0}' is a network address and the first-entry fallback only reads local files")]
    RemoteSkipped(String),
    #[error("failed reading {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed fetching {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("{origin} is not a decodable image")]
    Decode {
        origin: String,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOrigin {
    LocalFile(PathBuf),
    Remote(String),
    Inline,
}

impl fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalFile(path) => write!(f, "file:{}", path.display()),
            Self::Remote(url) => f.write_str(url),
            Self::Inline => f.write_str("inline"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub image: DynamicImage,
    pub origin: ImageOrigin,
}

impl ResolvedImage {
    /// SHA-256 over dimensions and RGBA pixels; equal for pixel-identical
    /// images regardless of how they were encoded on the way in.
    pub fn fingerprint(&self) -> String {
        let rgba = self.image.to_rgba8();
        let mut hasher = Sha256::new();
        hasher.update(rgba.width().to_be_bytes());
        hasher.update(rgba.height().to_be_bytes());
        hasher.update(rgba.as_raw());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of one normalization: the image, or its absence, plus the notes
/// collected while probing.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub image: Option<ResolvedImage>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    Any,
    LocalOnly,
}

/// Reduces a [`RemoteResult`] to a single decoded image.
///
/// Probes run in a fixed order and the first match wins:
/// 1. a sequence is scanned entry by entry (`image` field of a mapping, bare
///    text, or an already-decoded image), then its first entry is retried
///    against local files only;
/// 2. a mapping's `image` field;
/// 3. bare text;
/// 4. an already-decoded image.
///
/// Nothing here returns an error or panics on bad input: every failure turns
/// into a [`Diagnostic`].
#[derive(Debug, Clone)]
pub struct Normalizer<S> {
    source: S,
}

impl<S: ImageSource> Normalizer<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn resolve_image(&self, result: &RemoteResult) -> Resolution {
        let mut diagnostics = Vec::new();
        let image = match result {
            RemoteResult::Sequence(entries) => self.scan_sequence(entries, &mut diagnostics),
            RemoteResult::Image(image) => Some(inline(image)),
            other => match self.extract_and_resolve(other, Reach::Any) {
                Some(Ok(resolved)) => Some(resolved),
                Some(Err(failure)) => {
                    tracing::warn!(error = %failure, "remote result reference did not resolve");
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::CandidateResolutionFailure,
                        None,
                        failure.to_string(),
                    ));
                    None
                }
                None => {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::ShapeMismatch,
                        None,
                        mismatch_message(other),
                    ));
                    None
                }
            },
        };

        match &image {
            Some(resolved) => tracing::info!(
                origin = %resolved.origin,
                width = resolved.image.width(),
                height = resolved.image.height(),
                "resolved image from remote result"
            ),
            None => {
                tracing::info!(shape = result.shape(), "no valid image found in remote result");
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::TotalResolutionFailure,
                    None,
                    format!("no image found in {} result", result.shape()),
                ));
            }
        }

        Resolution { image, diagnostics }
    }

    fn scan_sequence(
        &self,
        entries: &[RemoteResult],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<ResolvedImage> {
        if entries.is_empty() {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::ShapeMismatch,
                None,
                "sequence has no entries",
            ));
            return None;
        }

        for (index, entry) in entries.iter().enumerate() {
            let outcome = match entry {
                RemoteResult::Image(image) => return Some(inline(image)),
                other => self.extract_and_resolve(other, Reach::Any),
            };
            match outcome {
                Some(Ok(resolved)) => return Some(resolved),
                Some(Err(failure)) => {
                    tracing::warn!(entry = index, error = %failure, "skipping result entry");
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::CandidateResolutionFailure,
                        Some(index),
                        failure.to_string(),
                    ));
                }
                None => {
                    tracing::debug!(entry = index, shape = entry.shape(), "result entry holds no reference");
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::ShapeMismatch,
                        Some(index),
                        mismatch_message(entry),
                    ));
                }
            }
        }

        // First entry again, mapping/text extraction only.
        match self.extract_and_resolve(&entries[0], Reach::LocalOnly)? {
            Ok(resolved) => Some(resolved),
            Err(failure) => {
                tracing::debug!(error = %failure, "first-entry fallback did not resolve");
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::CandidateResolutionFailure,
                    Some(0),
                    format!("fallback: {failure}"),
                ));
                None
            }
        }
    }

    /// `None` when the value carries no candidate reference at all.
    fn extract_and_resolve(
        &self,
        value: &RemoteResult,
        reach: Reach,
    ) -> Option<Result<ResolvedImage, CandidateFailure>> {
        match value {
            RemoteResult::Mapping(fields) => fields
                .get(IMAGE_KEY)
                .map(|field| self.resolve_field(field, reach)),
            RemoteResult::Text(reference) => Some(self.resolve_reference(reference, reach)),
            _ => None,
        }
    }

    fn resolve_field(
        &self,
        field: &RemoteResult,
        reach: Reach,
    ) -> Result<ResolvedImage, CandidateFailure> {
        match field {
            RemoteResult::Text(reference) => self.resolve_reference(reference, reach),
            RemoteResult::Image(image) => Ok(inline(image)),
            other => Err(CandidateFailure::NotAReference(other.shape())),
        }
    }

    fn resolve_reference(
        &self,
        reference: &str,
        reach: Reach,
    ) -> Result<ResolvedImage, CandidateFailure> {
        let path = Path::new(reference);
        if !reference.is_empty() && self.source.exists(path) {
            let bytes = self
                .source
                .read_file(path)
                .map_err(|err| CandidateFailure::Read {
                    path: reference.to_string(),
                    reason: format!("{err:#}"),
                })?;
            return decode(&bytes, ImageOrigin::LocalFile(path.to_path_buf()));
        }
        if is_network_address(reference) {
            if reach == Reach::LocalOnly {
                return Err(CandidateFailure::RemoteSkipped(truncate_text(reference, 200)));
            }
            let bytes = self
                .source
                .fetch(reference)
                .map_err(|err| CandidateFailure::Fetch {
                    url: reference.to_string(),
                    reason: format!("{err:#}"),
                })?;
            return decode(&bytes, ImageOrigin::Remote(reference.to_string()));
        }
        Err(CandidateFailure::UnsupportedReference(truncate_text(
            reference, 200,
        )))
    }
}

fn decode(bytes: &[u8], origin: ImageOrigin) -> Result<ResolvedImage, CandidateFailure> {
    match image::load_from_memory(bytes) {
        Ok(image) => Ok(ResolvedImage { image, origin }),
        Err(source) => Err(CandidateFailure::Decode {
            origin: origin.to_string(),
            source,
        }),
    }
}

fn inline(image: &DynamicImage) -> ResolvedImage {
    ResolvedImage {
        image: image.clone(),
        origin: ImageOrigin::Inline,
    }
}

fn mismatch_message(value: &RemoteResult) -> String {
    match value {
        RemoteResult::Mapping(_) => format!("mapping has no '{IMAGE_KEY}' key"),
        other => format!("{} value carries no image reference", other.shape()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FakeSource {
        files: HashMap<PathBuf, Vec<u8>>,
        urls: HashMap<String, Vec<u8>>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with_file(mut self, path: &str, bytes: Vec<u8>) -> Self {
            self.files.insert(PathBuf::from(path), bytes);
            self
        }

        fn with_url(mut self, url: &str, bytes: Vec<u8>) -> Self {
            self.urls.insert(url.to_string(), bytes);
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    impl ImageSource for FakeSource {
        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }

        fn read_file(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such file"))
        }

        fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.urls
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("image download failed (404)"))
        }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb(color)));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn pixel(resolution: &Resolution) -> [u8; 3] {
        let image = &resolution.image.as_ref().expect("expected an image").image;
        image.to_rgb8().get_pixel(0, 0).0
    }

    fn resolve(source: &FakeSource, value: serde_json::Value) -> Resolution {
        Normalizer::new(source).resolve_image(&RemoteResult::from_value(value))
    }

    #[test]
    fn sequence_mapping_with_image_key_reads_local_file() {
        let source = FakeSource::default().with_file("/tmp/out.png", png([200, 0, 0]));
        let resolution = resolve(&source, json!([{"image": "/tmp/out.png"}]));

        assert_eq!(pixel(&resolution), [200, 0, 0]);
        let resolved = resolution.image.unwrap();
        assert_eq!(resolved.origin, ImageOrigin::LocalFile(PathBuf::from("/tmp/out.png")));
        assert_eq!((resolved.image.width(), resolved.image.height()), (3, 2));
    }

    #[test]
    fn bare_text_path_reads_local_file() {
        let source = FakeSource::default().with_file("/tmp/out.png", png([0, 90, 0]));
        let resolution = resolve(&source, json!("/tmp/out.png"));
        assert_eq!(pixel(&resolution), [0, 90, 0]);
        assert!(resolution.diagnostics.is_empty());
    }

    #[test]
    fn bare_text_url_is_fetched() {
        let source =
            FakeSource::default().with_url("https://example.com/x.png", png([1, 2, 3]));
        let resolution = resolve(&source, json!("https://example.com/x.png"));

        assert_eq!(pixel(&resolution), [1, 2, 3]);
        assert_eq!(
            resolution.image.unwrap().origin,
            ImageOrigin::Remote("https://example.com/x.png".to_string())
        );
        assert_eq!(source.fetched(), vec!["https://example.com/x.png"]);
    }

    #[test]
    fn failed_fetch_yields_no_image() {
        let source = FakeSource::default();
        let resolution = resolve(&source, json!("http://example.com/missing.png"));

        assert!(resolution.image.is_none());
        assert_eq!(resolution.diagnostics.len(), 2);
        assert_eq!(resolution.diagnostics[0].kind, DiagnosticKind::CandidateResolutionFailure);
        assert!(resolution.diagnostics[0].message.contains("404"));
        assert_eq!(resolution.diagnostics[1].kind, DiagnosticKind::TotalResolutionFailure);
    }

    #[test]
    fn unmatched_shapes_yield_no_image() {
        let source = FakeSource::default();
        for value in [json!(42), json!([]), json!(null), json!(true), json!({"foo": "bar"})] {
            let resolution = resolve(&source, value);
            assert!(resolution.image.is_none());
            assert_eq!(
                resolution.diagnostics.last().map(|note| note.kind),
                Some(DiagnosticKind::TotalResolutionFailure)
            );
        }
    }

    #[test]
    fn mapping_without_image_key_in_sequence_yields_no_image() {
        let source = FakeSource::default();
        let resolution = resolve(&source, json!([{"foo": "bar"}]));

        assert!(resolution.image.is_none());
        assert_eq!(resolution.diagnostics[0].kind, DiagnosticKind::ShapeMismatch);
        assert_eq!(resolution.diagnostics[0].entry, Some(0));
        assert!(source.fetched().is_empty());
    }

    #[test]
    fn failing_entries_are_skipped_until_one_resolves() {
        let source = FakeSource::default()
            .with_file("/tmp/garbage.png", b"not an image".to_vec())
            .with_file("/tmp/good.png", png([5, 6, 7]));
        let resolution = resolve(
            &source,
            json!([
                {"image": "/tmp/missing.png"},
                "/tmp/garbage.png",
                7,
                {"image": {"nested": true}},
                {"image": "/tmp/good.png", "caption": null},
            ]),
        );

        assert_eq!(pixel(&resolution), [5, 6, 7]);
        let kinds: Vec<(DiagnosticKind, Option<usize>)> = resolution
            .diagnostics
            .iter()
            .map(|note| (note.kind, note.entry))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DiagnosticKind::CandidateResolutionFailure, Some(0)),
                (DiagnosticKind::CandidateResolutionFailure, Some(1)),
                (DiagnosticKind::ShapeMismatch, Some(2)),
                (DiagnosticKind::CandidateResolutionFailure, Some(3)),
            ]
        );
        assert!(resolution.diagnostics[1].message.contains("not a decodable image"));
        assert!(resolution.diagnostics[3].message.contains("expected a text reference"));
    }

    #[test]
    fn first_matching_entry_wins() {
        let source = FakeSource::default()
            .with_file("/tmp/a.png", png([10, 10, 10]))
            .with_url("https://example.com/b.png", png([20, 20, 20]));
        let resolution = resolve(&source, json!(["/tmp/a.png", "https://example.com/b.png"]));

        assert_eq!(pixel(&resolution), [10, 10, 10]);
        assert!(source.fetched().is_empty());
    }

    #[test]
    fn decoded_image_entry_is_accepted_directly() {
        let source = FakeSource::default();
        let decoded = image::load_from_memory(&png([9, 9, 9])).unwrap();
        let result = RemoteResult::Sequence(vec![
            RemoteResult::from_value(json!({"foo": "bar"})),
            RemoteResult::Image(decoded),
        ]);
        let resolution = Normalizer::new(&source).resolve_image(&result);

        assert_eq!(pixel(&resolution), [9, 9, 9]);
        assert_eq!(resolution.image.unwrap().origin, ImageOrigin::Inline);
    }

    #[test]
    fn top_level_decoded_image_is_accepted() {
        let source = FakeSource::default();
        let decoded = image::load_from_memory(&png([4, 4, 4])).unwrap();
        let resolution = Normalizer::new(&source).resolve_image(&RemoteResult::from(decoded));
        assert_eq!(pixel(&resolution), [4, 4, 4]);
    }

    #[test]
    fn top_level_mapping_image_field_is_resolved() {
        let source = FakeSource::default().with_url("http://host/x.png", png([3, 3, 3]));
        let resolution = resolve(&source, json!({"image": "http://host/x.png", "seed": 7}));
        assert_eq!(pixel(&resolution), [3, 3, 3]);
    }

    #[test]
    fn inline_data_url_text_is_not_an_image_reference() {
        let source = FakeSource::default();
        let url = format!("data:image/png;base64,{}", BASE64.encode(png([8, 8, 8])));
        for value in [json!(url.clone()), json!([{"image": url.clone()}])] {
            let resolution = resolve(&source, value);
            assert!(resolution.image.is_none());
            assert!(resolution.diagnostics[0].message.contains("neither an existing file"));
        }
        assert!(source.fetched().is_empty());
    }

    #[test]
    fn unsupported_text_is_not_fetched() {
        let source = FakeSource::default();
        let resolution = resolve(&source, json!(["ftp://host/x.png", "just words"]));

        assert!(resolution.image.is_none());
        assert!(source.fetched().is_empty());
        assert!(resolution.diagnostics[0].message.contains("neither an existing file"));
    }

    #[test]
    fn fallback_retries_first_entry_without_refetching() {
        let source = FakeSource::default();
        let resolution = resolve(&source, json!([{"image": "https://example.com/x.png"}]));

        assert!(resolution.image.is_none());
        assert_eq!(source.fetched(), vec!["https://example.com/x.png"]);
        let fallback = resolution
            .diagnostics
            .iter()
            .find(|note| note.message.starts_with("fallback:"))
            .expect("fallback diagnostic");
        assert_eq!(fallback.entry, Some(0));
    }

    #[test]
    fn resolving_the_same_file_twice_is_pixel_identical() {
        let source = FakeSource::default().with_file("/tmp/out.png", png([50, 60, 70]));
        let normalizer = Normalizer::new(&source);
        let result = RemoteResult::from_value(json!([{"image": "/tmp/out.png"}]));

        let first = normalizer.resolve_image(&result).image.unwrap();
        let second = normalizer.resolve_image(&result).image.unwrap();
        assert_eq!(first.image.to_rgba8(), second.image.to_rgba8());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_source_encoding() {
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])));
        let rgba = DynamicImage::ImageRgba8(rgb.to_rgba8());
        let a = ResolvedImage {
            image: rgb,
            origin: ImageOrigin::Inline,
        };
        let b = ResolvedImage {
            image: rgba,
            origin: ImageOrigin::Remote("https://host/x.png".to_string()),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn diagnostic_display_includes_kind_and_entry() {
        let note = Diagnostic::new(DiagnosticKind::ShapeMismatch, Some(2), "no key");
        assert_eq!(note.to_string(), "shape_mismatch (entry 2): no key");
    }
}
