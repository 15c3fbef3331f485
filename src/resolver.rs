//! Image resolution: turn a source reference into decoded pixels.
//!
//! A source is either a direct image URL or a page that embeds one image
//! (a pin page). Pages are scanned for `og:image` first, then for the first
//! `pinimg` `<img>`. Every source gets exactly one fetch attempt.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use regex::Regex;
use reqwest::header::{HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Url;

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_USER_AGENT: &str = concat!("style-profile/", env!("CARGO_PKG_VERSION"));

/// Largest body we will buffer for one image or page.
const MAX_BODY_BYTES: usize = 25 * 1_024 * 1_024;

/// A fetched, decoded image. Owned by one pipeline item.
///
/// Only the pixels are kept; the encoded body is dropped once decoded.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// The source reference as given by the caller.
    pub source: String,
    /// Sniffed from the body; servers often label pins `application/octet-stream`.
    pub mime: String,
    pub pixels: RgbImage,
}

impl ResolvedImage {
    pub fn decode(source: impl Into<String>, body: &[u8]) -> Result<Self, ResolveError> {
        let format = image::guess_format(body).map_err(|e| ResolveError::Decode(e.to_string()))?;
        let pixels = image::load_from_memory_with_format(body, format)
            .map_err(|e| ResolveError::Decode(e.to_string()))?
            .to_rgb8();
        Ok(Self {
            source: source.into(),
            mime: format.to_mime_type().to_string(),
            pixels,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid source reference {0:?}")]
    InvalidSource(String),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("no embedded image found on {0}")]
    NoImage(String),
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch failed: {0}")]
    Request(String),
    /// The resolver itself is unusable; the run cannot continue.
    #[error("resolver unavailable: {0}")]
    Fatal(String),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::InvalidSource(_) => "invalid_source",
            ResolveError::Status { .. } => "http_status",
            ResolveError::NoImage(_) => "no_image",
            ResolveError::Decode(_) => "decode",
            ResolveError::Timeout(_) => "timeout",
            ResolveError::Request(_) => "request",
            ResolveError::Fatal(_) => "fatal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolveError::Fatal(_))
    }
}

#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, source: &str) -> Result<ResolvedImage, ResolveError>;
}

/// reqwest-backed resolver. One GET per source, plus one more when the
/// source turns out to be a page wrapping an image.
#[derive(Debug, Clone)]
pub struct HttpImageResolver {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpImageResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_timeout(DEFAULT_RESOLVE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ResolveError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ResolveError::Fatal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    /// Fetch a board page and list the image URLs it references.
    ///
    /// Static HTML only: boards that lazy-load pins via script yield only
    /// what the server rendered.
    pub async fn board_sources(&self, board_url: &str) -> Result<Vec<String>, ResolveError> {
        let url = parse_url(board_url)?;
        let (body, _) = self.fetch(&url).await?;
        let html = String::from_utf8_lossy(&body);
        let urls = board_image_urls(&html);
        tracing::info!(board = board_url, images = urls.len(), "Scanned board page");
        if urls.is_empty() {
            return Err(ResolveError::NoImage(board_url.to_string()));
        }
        Ok(urls)
    }

    async fn fetch(&self, url: &Url) -> Result<(Vec<u8>, Option<String>), ResolveError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ResolveError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_BODY_BYTES)
        {
            return Err(ResolveError::Decode(format!(
                "body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());
        let body = resp.bytes().await.map_err(|e| self.map_send_error(e))?;
        if body.len() > MAX_BODY_BYTES {
            return Err(ResolveError::Decode(format!(
                "body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }
        Ok((body.to_vec(), content_type))
    }

    fn map_send_error(&self, err: reqwest::Error) -> ResolveError {
        if err.is_timeout() {
            ResolveError::Timeout(self.timeout)
        } else {
            ResolveError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl ImageResolver for HttpImageResolver {
    async fn resolve(&self, source: &str) -> Result<ResolvedImage, ResolveError> {
        let url = parse_url(source)?;
        let (body, content_type) = self.fetch(&url).await?;

        let is_html = content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/html"));
        let body = if is_html && image::guess_format(&body).is_err() {
            let html = String::from_utf8_lossy(&body);
            let image_url = page_image_url(&html, &url)
                .ok_or_else(|| ResolveError::NoImage(source.to_string()))?;
            tracing::debug!(source, image_url = %image_url, "Resolved page to embedded image");
            self.fetch(&image_url).await?.0
        } else {
            body
        };

        let source = source.to_string();
        tokio::task::spawn_blocking(move || ResolvedImage::decode(source, &body))
            .await
            .map_err(|e| ResolveError::Decode(format!("decode task failed: {e}")))?
    }
}

fn parse_url(source: &str) -> Result<Url, ResolveError> {
    let url = Url::parse(source.trim())
        .map_err(|_| ResolveError::InvalidSource(source.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ResolveError::InvalidSource(source.to_string())),
    }
}

const OG_IMAGE_PATTERNS: [&str; 2] = [
    r#"(?is)<meta\b[^>]*?\bproperty\s*=\s*["']og:image(?::url)?["'][^>]*?\bcontent\s*=\s*["']([^"']+)["']"#,
    r#"(?is)<meta\b[^>]*?\bcontent\s*=\s*["']([^"']+)["'][^>]*?\bproperty\s*=\s*["']og:image(?::url)?["']"#,
];

const PINIMG_IMG_PATTERN: &str =
    r#"(?is)<img\b[^>]*?\bsrc\s*=\s*["']([^"']*pinimg\.com[^"']*)["']"#;

fn og_image_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        OG_IMAGE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn pinimg_img_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(PINIMG_IMG_PATTERN).ok())
        .as_ref()
}

fn unescape_attr(raw: &str) -> String {
    raw.replace("&amp;", "&")
}

/// The single image a page embeds: `og:image` first, then the first `pinimg` `<img>`.
/// Relative URLs are resolved against `base`.
pub fn page_image_url(html: &str, base: &Url) -> Option<Url> {
    let og = og_image_patterns()
        .iter()
        .filter_map(|re| re.captures(html))
        .filter_map(|c| c.get(1).map(|m| (m.start(), m.as_str())))
        .min_by_key(|(start, _)| *start)
        .map(|(_, url)| url);
    let found = og.or_else(|| {
        pinimg_img_pattern()?
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    })?;
    base.join(&unescape_attr(found)).ok()
}

/// Every `pinimg` image URL on a board page, deduplicated in first-seen order.
pub fn board_image_urls(html: &str) -> Vec<String> {
    let Some(pattern) = pinimg_img_pattern() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    pattern
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| unescape_attr(m.as_str()))
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
