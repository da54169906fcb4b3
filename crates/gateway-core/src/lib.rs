//! # Gateway Core
//!
//! Shared vocabulary of the LLM request gateway:
//! - Validated scalar and identifier newtypes
//! - Provider-agnostic request and response types
//! - Backend descriptors, model routes and capability descriptors
//! - The backend client trait
//! - Request fingerprints for the response cache
//! - The error taxonomy and per-call attempt log

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt;
pub mod backend;
pub mod descriptor;
pub mod error;
pub mod fingerprint;
pub mod request;
pub mod response;
pub mod types;

pub use attempt::{AttemptLog, AttemptOutcome, AttemptRecord, FailureDiagnosis};
pub use backend::{BackendCall, LlmBackend};
pub use descriptor::{
    BackendCapabilities, BackendDescriptor, CredentialRef, ModelPricing, ModelRoute, RateLimits,
};
pub use error::{BackendError, ErrorClass, FailureKind, GatewayError, GatewayResult};
pub use fingerprint::RequestFingerprint;
pub use request::{
    CallContext, ChatMessage, CompletionRequest, CompletionRequestBuilder, EmbeddingRequest,
    MessageRole, RequestMode,
};
pub use response::{
    CompletionResponse, EmbeddingResponse, FinishReason, ResponsePayload, TimedPayload, Usage,
};
pub use types::{ApiKey, BackendId, CallerId, MaxTokens, ModelName, Temperature, TopP, ValidationError};
