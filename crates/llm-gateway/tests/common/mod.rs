//! Shared fixtures for gateway integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use llm_gateway::{
    BackendDescriptor, BackendError, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    ErrorClass, GatewayConfig, LlmBackend, Usage,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// What a scripted backend does on one call
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer after the given delay
    Reply(Duration),
    /// Fail with a transient server error
    Transient,
    /// Fail with a permanent authentication error
    Permanent,
}

/// Backend replaying scripted steps per backend id. The last step repeats;
/// backends without a script always reply at once.
#[derive(Default)]
pub struct Scripted {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, backend: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(backend.to_string(), steps.into());
        self
    }

    /// Backend ids in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, backend: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == backend).count()
    }

    /// Completion requests as the backends received them
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next(&self, backend: &str) -> Step {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(backend) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Step::Reply(Duration::ZERO)),
            Some(queue) => queue.front().cloned().unwrap_or(Step::Reply(Duration::ZERO)),
            None => Step::Reply(Duration::ZERO),
        }
    }

    async fn run(&self, target: &BackendDescriptor) -> Result<(), BackendError> {
        self.calls.lock().push(target.id.to_string());
        match self.next(target.id.as_str()) {
            Step::Reply(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Step::Transient => Err(BackendError::transient(ErrorClass::ServerError, "upstream overloaded")),
            Step::Permanent => Err(BackendError::permanent(ErrorClass::Authentication, "invalid api key")),
        }
    }
}

#[async_trait]
impl LlmBackend for Scripted {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        target: &BackendDescriptor,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        self.requests.lock().push(request.clone());
        self.run(target).await?;
        Ok(CompletionResponse::new(
            format!("from {}", target.id),
            Usage::new(10, 5),
            target.id.clone(),
            &target.model,
        ))
    }

    async fn embed(
        &self,
        target: &BackendDescriptor,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, BackendError> {
        self.run(target).await?;
        let vectors = request.texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect();
        Ok(EmbeddingResponse::new(vectors, Usage::new(4, 0), target.id.clone(), &target.model))
    }
}

/// Scripted backend entry for a config document
pub fn backend_yaml(id: &str, extra: &str) -> String {
    format!(
        "  - id: {id}\n    provider: scripted\n    model: {id}-model\n    endpoint: http://scripted.local\n{extra}"
    )
}

/// Gateway configuration with the given `backends` and `models` sections.
/// Retries once with a 100ms base backoff and no jitter; never waits for
/// rate budget.
pub fn config(backends: &[String], models: &str) -> GatewayConfig {
    let yaml = format!(
        "retry:\n  num_retries: 1\n  backoff_base_ms: 100\n  backoff_cap_ms: 1000\n  jitter: 0.0\n  max_rate_limit_wait: 0s\nbackends:\n{}\nmodels:\n{models}",
        backends.join("")
    );
    serde_yaml::from_str(&yaml).expect("valid test config")
}

/// One model named `chat` served by `primaries` then `fallbacks`
pub fn chat_model(primaries: &[&str], fallbacks: &[&str]) -> String {
    format!(
        "  - name: chat\n    backends: [{}]\n    fallbacks: [{}]\n",
        primaries.join(", "),
        fallbacks.join(", ")
    )
}
