//! # Gateway Providers
//!
//! Backend clients for the LLM request gateway:
//! - OpenAI-compatible HTTP client (OpenAI, LiteLLM and self-hosted servers)
//! - Provider-keyed client pool

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod openai_compatible;
pub mod registry;

pub use openai_compatible::{OpenAiCompatibleBackend, OPENAI_COMPATIBLE_PROVIDERS};
pub use registry::BackendPool;
