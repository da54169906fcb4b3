//! Provider-agnostic response types.
//!
//! Backends translate their wire responses into these types; callers never
//! see provider SDK objects.

use crate::request::RequestMode;
use crate::types::BackendId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,

    /// Number of tokens in the completion
    pub completion_tokens: u32,

    /// Total number of tokens used
    pub total_tokens: u32,
}

impl Usage {
    /// Create a new usage record
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Add another usage record to this one
    pub fn add(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Reason for finishing generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop (end of message)
    Stop,
    /// Hit max_tokens limit
    Length,
    /// Model made tool calls
    ToolCalls,
    /// Content was filtered
    ContentFilter,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ToolCalls => write!(f, "tool_calls"),
            Self::ContentFilter => write!(f, "content_filter"),
        }
    }
}

/// Result of a text generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text
    pub text: String,
    /// Token usage reported by the backend
    pub usage: Usage,
    /// Backend that produced the response
    pub backend: BackendId,
    /// Physical model name reported by the backend
    pub model: String,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Whether the response was served from cache
    #[serde(default)]
    pub cached: bool,
}

impl CompletionResponse {
    /// Create a response
    #[must_use]
    pub fn new(text: impl Into<String>, usage: Usage, backend: BackendId, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage,
            backend,
            model: model.into(),
            finish_reason: None,
            cached: false,
        }
    }

    /// Set the finish reason
    #[must_use]
    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

/// Result of an embedding call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// One vector per input text, in input order
    pub vectors: Vec<Vec<f32>>,
    /// Token usage reported by the backend
    pub usage: Usage,
    /// Backend that produced the response
    pub backend: BackendId,
    /// Physical model name reported by the backend
    pub model: String,
    /// Whether the response was served from cache
    #[serde(default)]
    pub cached: bool,
}

impl EmbeddingResponse {
    /// Create a response
    #[must_use]
    pub fn new(vectors: Vec<Vec<f32>>, usage: Usage, backend: BackendId, model: impl Into<String>) -> Self {
        Self {
            vectors,
            usage,
            backend,
            model: model.into(),
            cached: false,
        }
    }
}

/// Any successful backend result; the unit stored in the response cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Text generation result
    Completion(CompletionResponse),
    /// Embedding result
    Embedding(EmbeddingResponse),
}

impl ResponsePayload {
    /// Token usage of the underlying call
    #[must_use]
    pub fn usage(&self) -> Usage {
        match self {
            Self::Completion(r) => r.usage,
            Self::Embedding(r) => r.usage,
        }
    }

    /// Backend that produced the payload
    #[must_use]
    pub fn backend(&self) -> &BackendId {
        match self {
            Self::Completion(r) => &r.backend,
            Self::Embedding(r) => &r.backend,
        }
    }

    /// Kind of call that produced the payload
    #[must_use]
    pub fn mode(&self) -> RequestMode {
        match self {
            Self::Completion(_) => RequestMode::Generate,
            Self::Embedding(_) => RequestMode::Embed,
        }
    }

    /// Mark the payload as served from cache
    #[must_use]
    pub fn into_cached(self) -> Self {
        match self {
            Self::Completion(mut r) => {
                r.cached = true;
                Self::Completion(r)
            }
            Self::Embedding(mut r) => {
                r.cached = true;
                Self::Embedding(r)
            }
        }
    }
}

/// A payload together with the wall-clock time it was produced
#[derive(Debug, Clone, PartialEq)]
pub struct TimedPayload {
    /// The response
    pub payload: ResponsePayload,
    /// When the upstream response was received
    pub received_at: DateTime<Utc>,
}
