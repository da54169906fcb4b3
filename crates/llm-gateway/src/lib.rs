//! # LLM Gateway
//!
//! A routing and resilience layer between application callers and
//! heterogeneous LLM backends. Callers name a logical model; the gateway
//! resolves it to an ordered candidate list and drives the call through
//! rate limiting, retries with backoff, fallback, response caching and
//! usage accounting.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use llm_gateway::{CompletionRequest, Gateway};
//!
//! let gateway = Gateway::from_file("gateway.yaml").await?;
//! let reply = gateway
//!     .complete("chat", CompletionRequest::from_prompt("Hello", None))
//!     .await?;
//! println!("{} (via {})", reply.text, reply.backend);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod executor;
pub mod facade;
pub mod normalize;

pub use builder::GatewayBuilder;
pub use executor::{Execution, Executor, ExecutorSettings};
pub use facade::Gateway;
pub use normalize::RequestNormalizer;

pub use gateway_config::{ConfigLoader, ConfigWatcher, GatewayConfig, ReloadCommit, UnsupportedParamPolicy};
pub use gateway_core::{
    AttemptLog, AttemptOutcome, BackendCall, BackendDescriptor, BackendError, BackendId, CallContext,
    CallerId, ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    ErrorClass, FailureDiagnosis, GatewayError, GatewayResult, LlmBackend, ModelName, Usage,
};
pub use gateway_providers::{BackendPool, OpenAiCompatibleBackend};
pub use gateway_resilience::{CacheStats, CacheStore};
pub use gateway_routing::{ModelCatalog, ModelRegistry};
pub use gateway_telemetry::{
    init_logging, ChannelTraceSink, GatewayMetrics, TraceEvent, TraceSink, UsageFilter, UsageStore, UsageTotals,
    UsageTracker,
};
