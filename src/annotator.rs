//! Vision-model style annotation.
//!
//! The image is re-encoded as JPEG, sent as a `data:` URI alongside a
//! system prompt that spells out the annotation schema, and the reply is
//! validated against [`Annotation::from_json`].

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use uuid::Uuid;

use crate::annotation::{Annotation, AnnotationField, FieldGroup, ANNOTATION_SCHEMA_VERSION};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message, ProviderError};
use crate::resolver::ResolvedImage;

pub const DEFAULT_ANNOTATION_MODEL: &str = "anthropic/claude-3.5-sonnet";
pub const DEFAULT_ANNOTATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Longest side of the JPEG sent to the model.
const MAX_UPLOAD_DIM: u32 = 1_024;

#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("annotation request failed: {0}")]
    Request(#[from] ProviderError),
    #[error("malformed annotation: {0}")]
    Malformed(String),
    #[error("annotation timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not encode image for upload: {0}")]
    Encode(String),
}

impl AnnotationError {
    pub fn code(&self) -> &'static str {
        match self {
            AnnotationError::Request(e) => e.code(),
            AnnotationError::Malformed(_) => "malformed",
            AnnotationError::Timeout(_) => "timeout",
            AnnotationError::Encode(_) => "encode",
        }
    }

    /// Misconfiguration or rejected credentials. Every later item would fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnnotationError::Request(e) if e.is_auth_failure())
    }
}

#[async_trait]
pub trait StyleAnnotator: Send + Sync {
    async fn annotate(&self, image: &ResolvedImage) -> Result<Annotation, AnnotationError>;
}

/// Annotator backed by any [`ChatGateway`].
pub struct GatewayAnnotator {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    timeout: Duration,
    max_tokens: u32,
    job_id: Option<Uuid>,
}

impl GatewayAnnotator {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            gateway,
            model: DEFAULT_ANNOTATION_MODEL.to_string(),
            timeout: DEFAULT_ANNOTATION_TIMEOUT,
            max_tokens: 1_500,
            job_id: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attribute every provider call to a profiling run.
    pub fn job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    fn attribution(&self) -> Attribution {
        let attribution = Attribution::new("annotator::annotate");
        match self.job_id {
            Some(id) => attribution.with_job(id),
            None => attribution,
        }
    }
}

#[async_trait]
impl StyleAnnotator for GatewayAnnotator {
    async fn annotate(&self, image: &ResolvedImage) -> Result<Annotation, AnnotationError> {
        let pixels = image.pixels.clone();
        let data_uri = tokio::task::spawn_blocking(move || jpeg_data_uri(&pixels))
            .await
            .map_err(|e| AnnotationError::Encode(format!("encode task failed: {e}")))??;

        let messages = vec![
            Message::system(system_prompt()),
            Message::user_with_image(USER_PROMPT, data_uri),
        ];
        let req = ChatRequest::new(&self.model, messages, self.attribution())
            .temperature(0.2)
            .max_tokens(self.max_tokens)
            .json();

        let resp = tokio::time::timeout(self.timeout, self.gateway.chat(req))
            .await
            .map_err(|_| AnnotationError::Timeout(self.timeout))??;

        parse_annotation(&resp.content)
    }
}

/// Parse a raw model reply into a validated annotation.
pub fn parse_annotation(raw: &str) -> Result<Annotation, AnnotationError> {
    let json_str = extract_json(raw);
    let value: serde_json::Value = serde_json::from_str(json_str).map_err(|e| {
        let preview: String = raw.chars().take(200).collect();
        AnnotationError::Malformed(format!("not JSON ({e}); raw: {preview}"))
    })?;
    Annotation::from_json(&value).map_err(|v| AnnotationError::Malformed(v.to_string()))
}

const USER_PROMPT: &str = "Analyze the outfit and styling in this image.";

/// System prompt listing every schema field, grouped the way the reply may nest them.
pub fn system_prompt() -> String {
    let mut prompt = format!(
        "You are a professional fashion and style analyst. Describe the look in the image \
         using short, specific phrases.\n\n\
         Respond with JSON only (schema v{ANNOTATION_SCHEMA_VERSION}). Every value is a list \
         of strings; use an empty list when a field does not apply.\n\n"
    );
    for group in [FieldGroup::Analysis, FieldGroup::Recommendations] {
        prompt.push_str(&format!("\"{}\":\n", group.key()));
        for field in AnnotationField::ALL.into_iter().filter(|f| f.group() == group) {
            prompt.push_str(&format!("- {}: {}\n", field.key(), field_hint(field)));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Example: {\"analysis\": {\"garments\": [\"oversized denim jacket\"], ...}, \
         \"recommendations\": {\"styling_tips\": [\"roll the sleeves once\"], ...}}",
    );
    prompt
}

fn field_hint(field: AnnotationField) -> &'static str {
    match field {
        AnnotationField::Garments => "clothing items with notable details",
        AnnotationField::ColorScheme => "named colors and how they are combined",
        AnnotationField::HairStyle => "hair cut, texture and styling",
        AnnotationField::StyleDescriptors => {
            "style categories, e.g. bohemian, minimalist, preppy"
        }
        AnnotationField::Accessories => "bags, jewelry, shoes, belts, eyewear",
        AnnotationField::Occasions => "occasions the look suits",
        AnnotationField::DesignElements => "prints, textures, silhouettes, cuts",
        AnnotationField::OutfitRecommendations => "outfits that extend this look",
        AnnotationField::MakeupTips => "makeup that complements the look",
        AnnotationField::StylingTips => "practical tips to recreate the look",
    }
}

fn jpeg_data_uri(pixels: &RgbImage) -> Result<String, AnnotationError> {
    let (w, h) = pixels.dimensions();
    let longest = w.max(h);
    let resized;
    let upload = if longest > MAX_UPLOAD_DIM {
        let scale = MAX_UPLOAD_DIM as f64 / longest as f64;
        let nw = ((w as f64 * scale).round() as u32).max(1);
        let nh = ((h as f64 * scale).round() as u32).max(1);
        resized = imageops::resize(pixels, nw, nh, FilterType::Triangle);
        &resized
    } else {
        pixels
    };

    let mut buf = Cursor::new(Vec::new());
    upload
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| AnnotationError::Encode(e.to_string()))?;
    let encoded = general_purpose::STANDARD.encode(buf.into_inner());
    Ok(format!("data:image/jpeg;base64,{encoded}"))
}

/// Extract a JSON object from potentially noisy LLM output.
///
/// Handles pure JSON, JSON wrapped in markdown fences and JSON embedded in prose.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Byte offset just past the brace closing the first object. Braces inside strings are skipped.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
