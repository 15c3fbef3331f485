//! Request and response shapes for one vision-model call.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Who asked for a call. Copied onto every usage record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attribution {
    /// Static call-site name, e.g. `"annotator::annotate"`.
    pub caller: &'static str,
    /// Profiling run the call belongs to.
    pub job_id: Option<Uuid>,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            job_id: None,
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One prompt turn. `images` are `data:` URIs or URLs sent as `image_url`
/// parts after the text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user_with_image(content: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            images: vec![image_url.into()],
            ..Self::user(content)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// OpenRouter model id, e.g. `"anthropic/claude-3.5-sonnet"`.
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Ask for `response_format: json_object`.
    pub json_mode: bool,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            json_mode: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Bytes the request body will carry: prompt text plus encoded images.
    pub fn payload_bytes(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.content.len() + m.images.iter().map(String::len).sum::<usize>())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Hit `max_tokens`; the JSON is probably truncated.
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") | Some("end_turn") => Self::Stop,
            Some("length") | Some("max_tokens") => Self::Length,
            Some("content_filter") => Self::ContentFilter,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other(String::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Estimated from the pricing table, in nanodollars.
    pub cost_nanodollars: i64,
    pub latency: Duration,
    pub request_id: Option<String>,
}
