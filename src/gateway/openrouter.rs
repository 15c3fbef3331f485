//! OpenRouter `chat/completions` client for single-image annotation calls.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::estimate_cost;
use super::types::{ChatRequest, ChatResponse, FinishReason, Message, Role};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Text plus one base64 JPEG of at most 1024 px is far below this.
pub const MAX_REQUEST_BYTES: usize = 8 * 1_024 * 1_024;

/// A style annotation is a few hundred tokens of JSON.
pub const MAX_RESPONSE_BYTES: usize = 256 * 1_024;

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Sent as `HTTP-Referer` for OpenRouter app attribution.
    pub referer: Option<String>,
    /// Sent as `X-Title`.
    pub app_title: Option<String>,
}

impl OpenRouterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            referer: None,
            app_title: Some("style-profile".to_string()),
        }
    }

    /// Reads `OPENROUTER_API_KEY` plus the optional `OPENROUTER_BASE_URL`,
    /// `OPENROUTER_TIMEOUT_SECONDS`, `OPENROUTER_REFERER` and
    /// `OPENROUTER_APP_TITLE`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENROUTER_BASE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        config.referer = std::env::var("OPENROUTER_REFERER").ok();
        if let Ok(title) = std::env::var("OPENROUTER_APP_TITLE") {
            config.app_title = Some(title);
        }
        Ok(config)
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl OpenRouterAdapter {
    pub fn new(config: OpenRouterConfig) -> Result<Self, ProviderError> {
        let key = config.api_key.trim();
        if key.is_empty() {
            return Err(ProviderError::config("API key is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| ProviderError::config("API key is not a valid header value"))?;
        headers.insert(AUTHORIZATION, auth);
        for (name, value) in [
            ("HTTP-Referer", config.referer.as_deref()),
            ("X-Title", config.app_title.as_deref()),
        ] {
            if let Some(v) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, v);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            timeout: config.timeout,
        })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(OpenRouterConfig::from_env()?)
    }

    fn send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Transport(err)
        }
    }

    /// One HTTP attempt. Retries belong to [`super::ProviderGateway`].
    pub async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let size = req.payload_bytes();
        if size > MAX_REQUEST_BYTES {
            return Err(ProviderError::TooLarge {
                what: "request payload",
                size,
                limit: MAX_REQUEST_BYTES,
            });
        }

        let start = Instant::now();
        let body = WireRequest {
            model: &req.model,
            messages: req.messages.iter().map(WireMessage::from).collect(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(WireFormat {
                kind: "json_object",
            }),
        };

        let mut response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status().as_u16();
        let request_id = header_str(response.headers(), "x-request-id");
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.send_error(e))? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(ProviderError::TooLarge {
                    what: "response body",
                    size: bytes.len() + chunk.len(),
                    limit: MAX_RESPONSE_BYTES,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        let parsed = serde_json::from_slice::<WireResponse>(&bytes);

        if !(200..300).contains(&status) {
            let error = parsed.ok().and_then(|r| r.error);
            let context = ErrorContext {
                http_status: Some(status),
                provider_code: error.as_ref().and_then(|e| e.code_string()),
                request_id,
            };
            let message = error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(ProviderError::from_status(message, retry_after, context));
        }

        let parsed = parsed.map_err(|e| ProviderError::Upstream {
            message: format!("invalid completion JSON: {e}"),
            retryable: false,
            context: ErrorContext {
                http_status: Some(status),
                provider_code: None,
                request_id: request_id.clone(),
            },
        })?;

        // OpenRouter reports some upstream failures inside a 200.
        if let Some(error) = parsed.error {
            return Err(ProviderError::Upstream {
                message: error.message.clone().unwrap_or_default(),
                retryable: false,
                context: ErrorContext {
                    http_status: Some(status),
                    provider_code: error.code_string(),
                    request_id,
                },
            });
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::upstream("completion has no choices"))?;
        let finish_reason = FinishReason::parse(choice.finish_reason.as_deref());
        let content = choice.message.and_then(|m| m.content).unwrap_or_default();

        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::refused("reply withheld by content filter"));
        }
        if is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            finish_reason,
            input_tokens,
            output_tokens,
            cost_nanodollars: estimate_cost(&req.model, input_tokens, output_tokens),
            latency: start.elapsed(),
            request_id,
        })
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Delta-seconds form only; HTTP dates fall back to the gateway's backoff.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Prose declining the task, with no JSON object anywhere in it.
fn is_refusal(content: &str) -> bool {
    if content.contains('{') {
        return false;
    }
    let lower = content.trim_start().to_lowercase();
    [
        "i can't",
        "i cannot",
        "i'm unable",
        "i am unable",
        "i won't",
        "sorry",
    ]
    .iter()
    .any(|p| lower.starts_with(p))
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireFormat>,
}

#[derive(Serialize)]
struct WireFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: WireContent<'a>,
}

/// Plain string for text-only turns, part list once an image is attached.
#[derive(Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<WirePart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: WireImage<'a> },
}

#[derive(Serialize)]
struct WireImage<'a> {
    url: &'a str,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(m: &'a Message) -> Self {
        let content = if m.images.is_empty() {
            WireContent::Text(&m.content)
        } else {
            let mut parts = vec![WirePart::Text { text: &m.content }];
            parts.extend(m.images.iter().map(|url| WirePart::ImageUrl {
                image_url: WireImage { url },
            }));
            WireContent::Parts(parts)
        };
        Self {
            role: m.role,
            content,
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: Option<WireReply>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl WireError {
    fn code_string(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}
