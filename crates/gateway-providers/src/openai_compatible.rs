//! OpenAI-compatible HTTP backend.
//!
//! Serves any descriptor whose endpoint speaks the OpenAI wire format
//! (`/chat/completions`, `/embeddings`): OpenAI itself, LiteLLM proxies and
//! self-hosted servers. The descriptor supplies endpoint, model, credential
//! and timeout on every call, so one client serves many backends.

use async_trait::async_trait;
use gateway_core::{
    BackendDescriptor, BackendError, ChatMessage, CompletionRequest, CompletionResponse,
    EmbeddingRequest, EmbeddingResponse, ErrorClass, FinishReason, GatewayError, GatewayResult,
    LlmBackend, MessageRole, Usage,
};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Provider identifiers served by this client
pub const OPENAI_COMPATIBLE_PROVIDERS: &[&str] = &["openai", "openai-compatible", "litellm"];

/// Longest upstream error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Upper bound on a provider-supplied retry hint
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// OpenAI-compatible backend client
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    provider: String,
    client: Client,
}

impl OpenAiCompatibleBackend {
    /// Create a client for `provider`
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created
    pub fn new(provider: impl Into<String>, connect_timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(provider, client))
    }

    /// Wrap an existing client
    #[must_use]
    pub fn with_client(provider: impl Into<String>, client: Client) -> Self {
        Self {
            provider: provider.into(),
            client,
        }
    }

    fn url(target: &BackendDescriptor, path: &str) -> String {
        format!("{}/{path}", target.endpoint.trim_end_matches('/'))
    }

    fn authorize(builder: RequestBuilder, target: &BackendDescriptor) -> Result<RequestBuilder, BackendError> {
        match target.credential.resolve() {
            Ok(Some(key)) => Ok(builder.bearer_auth(key.expose_secret())),
            Ok(None) => Ok(builder),
            Err(reason) => Err(BackendError::permanent(ErrorClass::Authentication, reason)),
        }
    }

    async fn post<B, T>(&self, target: &BackendDescriptor, path: &str, body: &B) -> Result<T, BackendError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = Self::url(target, path);
        debug!(
            backend = %target.id,
            provider = %self.provider,
            model = %target.model,
            url = %url,
            "Sending request"
        );

        let builder = self.client.post(&url).timeout(target.timeout).json(body);
        let response = Self::authorize(builder, target)?
            .send()
            .await
            .map_err(|e| classify_transport(&e, target.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let message = upstream_message(&body).unwrap_or_else(|| truncate(&body));
            warn!(
                backend = %target.id,
                status = status.as_u16(),
                error = %message,
                "Upstream returned an error"
            );
            return Err(BackendError::from_status(status.as_u16(), message, retry_after));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, target.timeout))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            BackendError::new(ErrorClass::MalformedResponse, format!("Failed to parse response: {e}"))
        })
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn complete(
        &self,
        target: &BackendDescriptor,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        let body = ChatRequest::from_request(&target.model, request);
        let response: ChatResponse = self.post(target, "chat/completions", &body).await?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            BackendError::new(ErrorClass::MalformedResponse, "response contained no choices")
        })?;
        let text = choice.message.content.unwrap_or_default();
        // Some compatible servers omit the usage block
        let usage = response.usage.map_or_else(
            || Usage::new(request.estimated_prompt_tokens(), estimate_tokens(&text)),
            WireUsage::into_usage,
        );
        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse::new(
            text,
            usage,
            target.id.clone(),
            response.model.unwrap_or_else(|| target.model.clone()),
        )
        .with_finish_reason(finish_reason))
    }

    async fn embed(
        &self,
        target: &BackendDescriptor,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, BackendError> {
        let body = EmbeddingsRequest {
            model: &target.model,
            input: &request.texts,
            extra: request.extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let response: EmbeddingsResponse = self.post(target, "embeddings", &body).await?;

        if response.data.len() != request.texts.len() {
            return Err(BackendError::new(
                ErrorClass::MalformedResponse,
                format!(
                    "expected {} embeddings, received {}",
                    request.texts.len(),
                    response.data.len()
                ),
            ));
        }
        let mut data = response.data;
        data.sort_by_key(|d| d.index);

        Ok(EmbeddingResponse::new(
            data.into_iter().map(|d| d.embedding).collect(),
            response
                .usage
                .map_or_else(|| Usage::new(request.estimated_tokens(), 0), WireUsage::into_usage),
            target.id.clone(),
            response.model.unwrap_or_else(|| target.model.clone()),
        ))
    }
}

fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

fn classify_transport(error: &reqwest::Error, timeout: Duration) -> BackendError {
    if error.is_timeout() {
        BackendError::timeout(timeout)
    } else if error.is_connect() || error.is_request() {
        BackendError::new(ErrorClass::Connection, format!("Request failed: {error}"))
    } else if error.is_body() || error.is_decode() {
        BackendError::new(ErrorClass::MalformedResponse, format!("Failed to read response: {error}"))
    } else {
        BackendError::transient(ErrorClass::Connection, format!("Request failed: {error}"))
    }
}

/// `retry-after-ms` first, then `retry-after` in seconds, capped at
/// [`MAX_RETRY_AFTER`]
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| *v >= 0.0)
    };
    header("retry-after-ms")
        .and_then(|ms| seconds_to_duration(ms / 1000.0))
        .or_else(|| header("retry-after").and_then(seconds_to_duration))
}

fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() {
        return None;
    }
    if seconds == 0.0 {
        return Some(Duration::ZERO);
    }
    Some(Duration::try_from_secs_f64(seconds).map_or(MAX_RETRY_AFTER, |d| d.min(MAX_RETRY_AFTER)))
}

fn upstream_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(Value::as_str);
    Some(match code {
        Some(code) => truncate(&format!("{code}: {message}")),
        None => truncate(message),
    })
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl<'a> ChatRequest<'a> {
    fn from_request(model: &'a str, request: &'a CompletionRequest) -> Self {
        let mut extra: Map<String, Value> = request.extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(variables) = &request.prompt_variables {
            extra.insert(
                "prompt_variables".to_string(),
                Value::Object(variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            );
        }
        Self {
            model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: request.temperature.map(|t| t.value()),
            max_tokens: request.max_tokens.map(|m| m.value()),
            top_p: request.top_p.map(|t| t.value()),
            stop: &request.stop,
            seed: request.seed,
            extra,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        Self {
            role,
            content: &message.content,
            name: message.name.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}
