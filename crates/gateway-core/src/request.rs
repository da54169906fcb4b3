//! Request types accepted by the gateway.
//!
//! Requests are provider-agnostic: a backend adapter turns them into its own
//! wire format. Every request can report the names of the optional
//! parameters it carries so capability checks can strip or reject them.

use crate::types::{CallerId, MaxTokens, Temperature, TopP, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rough characters-per-token ratio used for pre-call estimates
const CHARS_PER_TOKEN: usize = 4;
/// Per-message framing overhead added to prompt estimates
const TOKENS_PER_MESSAGE: u32 = 4;

/// Kind of call a request represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Text generation (chat completion)
    Generate,
    /// Vector embedding
    Embed,
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Embed => write!(f, "embed"),
        }
    }
}

/// Role of a chat message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions
    System,
    /// End-user or application input
    User,
    /// Prior model output
    Assistant,
    /// Tool result
    Tool,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Optional author name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a message with the given role
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Chat completion request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation so far
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Temperature>,

    /// Completion budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<MaxTokens>,

    /// Nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<TopP>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Sampling seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Variables for a server-side prompt template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_variables: Option<BTreeMap<String, Value>>,

    /// Additional provider parameters passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl CompletionRequest {
    /// Create a request builder
    #[must_use]
    pub fn builder() -> CompletionRequestBuilder {
        CompletionRequestBuilder::default()
    }

    /// Create a request from a single prompt with an optional system prompt
    #[must_use]
    pub fn from_prompt(prompt: impl Into<String>, system_prompt: Option<&str>) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Create a request that renders a server-side template from variables
    #[must_use]
    pub fn from_prompt_variables(variables: BTreeMap<String, Value>) -> Self {
        Self {
            prompt_variables: Some(variables),
            ..Self::default()
        }
    }

    /// Check structural validity
    ///
    /// # Errors
    /// Returns `ValidationError::Empty` when neither messages nor prompt
    /// variables are present
    pub fn validate(&self) -> Result<(), ValidationError> {
        let has_variables = self.prompt_variables.as_ref().is_some_and(|v| !v.is_empty());
        if self.messages.is_empty() && !has_variables {
            return Err(ValidationError::Empty { field: "messages" });
        }
        Ok(())
    }

    /// Fill unset sampling parameters with gateway defaults
    pub fn apply_defaults(&mut self, temperature: Temperature, max_tokens: MaxTokens) {
        self.temperature.get_or_insert(temperature);
        self.max_tokens.get_or_insert(max_tokens);
    }

    /// Names of the optional parameters set on this request
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.temperature.is_some() {
            names.push("temperature".to_string());
        }
        if self.max_tokens.is_some() {
            names.push("max_tokens".to_string());
        }
        if self.top_p.is_some() {
            names.push("top_p".to_string());
        }
        if !self.stop.is_empty() {
            names.push("stop".to_string());
        }
        if self.seed.is_some() {
            names.push("seed".to_string());
        }
        if self.prompt_variables.is_some() {
            names.push("prompt_variables".to_string());
        }
        names.extend(self.extra.keys().cloned());
        names
    }

    /// Remove an optional parameter, returning whether it was present
    pub fn remove_parameter(&mut self, name: &str) -> bool {
        match name {
            "temperature" => self.temperature.take().is_some(),
            "max_tokens" => self.max_tokens.take().is_some(),
            "top_p" => self.top_p.take().is_some(),
            "stop" => !std::mem::take(&mut self.stop).is_empty(),
            "seed" => self.seed.take().is_some(),
            "prompt_variables" => self.prompt_variables.take().is_some(),
            other => self.extra.remove(other).is_some(),
        }
    }

    /// Estimated prompt size in tokens (character heuristic)
    #[must_use]
    pub fn estimated_prompt_tokens(&self) -> u32 {
        let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        let variables = self
            .prompt_variables
            .as_ref()
            .map_or(0, |v| serde_json::to_string(v).map_or(0, |s| s.len()));
        let framing = TOKENS_PER_MESSAGE.saturating_mul(self.messages.len() as u32);
        to_tokens(chars + variables).saturating_add(framing)
    }

    /// Estimated total token cost: prompt estimate plus the completion budget
    #[must_use]
    pub fn estimated_tokens(&self) -> u32 {
        let completion = self.max_tokens.map_or(0, |m| m.value());
        self.estimated_prompt_tokens().saturating_add(completion)
    }
}

/// Builder for `CompletionRequest`
#[derive(Debug, Default)]
pub struct CompletionRequestBuilder {
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    stop: Vec<String>,
    seed: Option<u64>,
    extra: BTreeMap<String, Value>,
}

impl CompletionRequestBuilder {
    /// Append a message
    #[must_use]
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Replace all messages
    #[must_use]
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set top-p
    #[must_use]
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Add a stop sequence
    #[must_use]
    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    /// Set the sampling seed
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Add a passthrough provider parameter
    #[must_use]
    pub fn extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Build and validate the request
    ///
    /// # Errors
    /// Returns `ValidationError` if any parameter is out of range or the
    /// message list is empty
    pub fn build(self) -> Result<CompletionRequest, ValidationError> {
        let request = CompletionRequest {
            messages: self.messages,
            temperature: self.temperature.map(Temperature::new).transpose()?,
            max_tokens: self.max_tokens.map(MaxTokens::new).transpose()?,
            top_p: self.top_p.map(TopP::new).transpose()?,
            stop: self.stop,
            seed: self.seed,
            prompt_variables: None,
            extra: self.extra,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Embedding request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Texts to embed, one vector is returned per text
    pub texts: Vec<String>,

    /// Additional provider parameters passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl EmbeddingRequest {
    /// Create an embedding request
    #[must_use]
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            texts: texts.into_iter().map(Into::into).collect(),
            extra: BTreeMap::new(),
        }
    }

    /// Check structural validity
    ///
    /// # Errors
    /// Returns `ValidationError::Empty` when there is nothing to embed
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.texts.is_empty() {
            return Err(ValidationError::Empty { field: "texts" });
        }
        Ok(())
    }

    /// Names of the optional parameters set on this request
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        self.extra.keys().cloned().collect()
    }

    /// Remove an optional parameter, returning whether it was present
    pub fn remove_parameter(&mut self, name: &str) -> bool {
        self.extra.remove(name).is_some()
    }

    /// Estimated token cost (character heuristic)
    #[must_use]
    pub fn estimated_tokens(&self) -> u32 {
        to_tokens(self.texts.iter().map(|t| t.chars().count()).sum())
    }
}

fn to_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Per-call context supplied by the caller.
///
/// Carries identity for usage attribution and the signals that bound the
/// call: an optional deadline and a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Caller identity
    pub caller: CallerId,
    /// Conversation/session identifier
    pub session_id: Option<String>,
    /// Instant after which no new attempt may start
    pub deadline: Option<Instant>,
    /// Cancellation signal
    pub cancellation: CancellationToken,
    /// Skip cache lookup and storage for this call
    pub bypass_cache: bool,
    /// Free-form metadata forwarded to the trace sink
    pub metadata: BTreeMap<String, String>,
}

impl CallContext {
    /// Create a context for the given caller
    #[must_use]
    pub fn new(caller: CallerId) -> Self {
        Self {
            caller,
            ..Self::default()
        }
    }

    /// Attach a session identifier
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set an absolute deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Use an externally owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Skip the response cache for this call
    #[must_use]
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    /// Add trace metadata
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Time left before the deadline, `None` when unbounded
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline passed or the call was cancelled
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled() || self.remaining().is_some_and(|r| r.is_zero())
    }
}
