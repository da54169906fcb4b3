//! Backend client trait.
//!
//! A backend client knows how to talk to one provider family. It is stateless
//! with respect to routing: the descriptor passed to each call says which
//! endpoint, model and credential to use.

use crate::descriptor::BackendDescriptor;
use crate::error::BackendError;
use crate::request::{CompletionRequest, EmbeddingRequest, RequestMode};
use crate::response::{CompletionResponse, EmbeddingResponse, ResponsePayload};
use async_trait::async_trait;

/// Core trait for all backend clients
#[async_trait]
pub trait LlmBackend: Send + Sync + 'static {
    /// Provider identifier this client serves (matches `BackendDescriptor::provider`)
    fn provider(&self) -> &str;

    /// Execute a chat completion against the descriptor's endpoint
    ///
    /// # Errors
    /// Returns a classified `BackendError` on any failure
    async fn complete(
        &self,
        target: &BackendDescriptor,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError>;

    /// Compute embeddings against the descriptor's endpoint
    ///
    /// # Errors
    /// Returns a classified `BackendError` on any failure
    async fn embed(
        &self,
        target: &BackendDescriptor,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, BackendError>;
}

/// A normalized request ready for invocation
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// Chat completion
    Complete(CompletionRequest),
    /// Embedding
    Embed(EmbeddingRequest),
}

impl BackendCall {
    /// Kind of call
    #[must_use]
    pub fn mode(&self) -> RequestMode {
        match self {
            Self::Complete(_) => RequestMode::Generate,
            Self::Embed(_) => RequestMode::Embed,
        }
    }

    /// Pre-call token estimate used for admission
    #[must_use]
    pub fn estimated_tokens(&self) -> u32 {
        match self {
            Self::Complete(r) => r.estimated_tokens(),
            Self::Embed(r) => r.estimated_tokens(),
        }
    }

    /// Names of optional parameters present on the request
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        match self {
            Self::Complete(r) => r.parameter_names(),
            Self::Embed(r) => r.parameter_names(),
        }
    }

    /// Remove an optional parameter, returning whether it was present
    pub fn remove_parameter(&mut self, name: &str) -> bool {
        match self {
            Self::Complete(r) => r.remove_parameter(name),
            Self::Embed(r) => r.remove_parameter(name),
        }
    }

    /// Capability a backend needs to serve this call
    #[must_use]
    pub fn required_capability(&self) -> &'static str {
        match self {
            Self::Complete(_) => "chat",
            Self::Embed(_) => "embeddings",
        }
    }

    /// Dispatch to the matching trait method
    ///
    /// # Errors
    /// Propagates the backend's classified failure
    pub async fn invoke(
        &self,
        backend: &dyn LlmBackend,
        target: &BackendDescriptor,
    ) -> Result<ResponsePayload, BackendError> {
        match self {
            Self::Complete(r) => backend.complete(target, r).await.map(ResponsePayload::Completion),
            Self::Embed(r) => backend.embed(target, r).await.map(ResponsePayload::Embedding),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Usage;
    use crate::types::BackendId;

    struct Echo;

    #[async_trait]
    impl LlmBackend for Echo {
        fn provider(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            target: &BackendDescriptor,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, BackendError> {
            let text = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResponse::new(text, Usage::new(1, 1), target.id.clone(), &target.model))
        }

        async fn embed(
            &self,
            target: &BackendDescriptor,
            request: &EmbeddingRequest,
        ) -> Result<EmbeddingResponse, BackendError> {
            let vectors = request.texts.iter().map(|t| vec![t.len() as f32]).collect();
            Ok(EmbeddingResponse::new(vectors, Usage::new(1, 0), target.id.clone(), &target.model))
        }
    }

    fn target() -> BackendDescriptor {
        BackendDescriptor::new(BackendId::new("echo-1").expect("valid id"), "echo", "echo-model", "mem://")
    }

    #[tokio::test]
    async fn test_invoke_dispatches_by_mode() {
        let call = BackendCall::Complete(CompletionRequest::from_prompt("ping", None));
        assert_eq!(call.required_capability(), "chat");
        match call.invoke(&Echo, &target()).await.expect("success") {
            ResponsePayload::Completion(r) => assert_eq!(r.text, "ping"),
            ResponsePayload::Embedding(_) => panic!("wrong payload"),
        }

        let call = BackendCall::Embed(EmbeddingRequest::new(["abc"]));
        assert_eq!(call.mode(), RequestMode::Embed);
        match call.invoke(&Echo, &target()).await.expect("success") {
            ResponsePayload::Embedding(r) => assert_eq!(r.vectors, vec![vec![3.0]]),
            ResponsePayload::Completion(_) => panic!("wrong payload"),
        }
    }
}
