//! Backend descriptors and model routes.
//!
//! A [`BackendDescriptor`] is one concrete routable target. A [`ModelRoute`]
//! maps a logical model name onto an ordered list of descriptors. Both are
//! immutable once built; the registry replaces them wholesale on reload.

use crate::error::{GatewayError, GatewayResult};
use crate::response::Usage;
use crate::types::{ApiKey, BackendId, ModelName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Per-backend throughput limits; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Requests admitted per rolling minute
    pub requests_per_minute: Option<u32>,
    /// Tokens admitted per rolling minute
    pub tokens_per_minute: Option<u32>,
}

impl RateLimits {
    /// No limits
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Limits with both budgets set
    #[must_use]
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests_per_minute: Some(requests_per_minute),
            tokens_per_minute: Some(tokens_per_minute),
        }
    }

    /// Fill unset budgets from defaults
    #[must_use]
    pub fn or(self, defaults: Self) -> Self {
        Self {
            requests_per_minute: self.requests_per_minute.or(defaults.requests_per_minute),
            tokens_per_minute: self.tokens_per_minute.or(defaults.tokens_per_minute),
        }
    }
}

/// Where a backend's credential comes from
#[derive(Debug, Clone, Default)]
pub enum CredentialRef {
    /// No credential (local model servers)
    #[default]
    None,
    /// Read from an environment variable at call time
    Env(String),
    /// Held in memory
    Inline(ApiKey),
}

impl CredentialRef {
    /// Resolve the credential
    ///
    /// # Errors
    /// Returns a message naming the variable when it is unset or empty
    pub fn resolve(&self) -> Result<Option<ApiKey>, String> {
        match self {
            Self::None => Ok(None),
            Self::Inline(key) => Ok(Some(key.clone())),
            Self::Env(var) => std::env::var(var)
                .ok()
                .and_then(|value| ApiKey::new(value).ok())
                .map(Some)
                .ok_or_else(|| format!("credential variable {var} is not set")),
        }
    }
}

/// Parameters most chat backends accept
pub const STANDARD_PARAMETERS: &[&str] = &["temperature", "max_tokens", "top_p", "stop", "seed"];

/// What a backend can do and which optional request parameters it accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Serves chat completions
    #[serde(default = "default_true")]
    pub chat: bool,

    /// Serves embeddings
    #[serde(default)]
    pub embeddings: bool,

    /// Optional request parameters forwarded to this backend
    #[serde(default = "standard_parameters")]
    pub parameters: BTreeSet<String>,
}

fn default_true() -> bool {
    true
}

fn standard_parameters() -> BTreeSet<String> {
    STANDARD_PARAMETERS.iter().map(|p| (*p).to_string()).collect()
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            chat: true,
            embeddings: false,
            parameters: standard_parameters(),
        }
    }
}

impl BackendCapabilities {
    /// Capabilities of an embedding-only backend
    #[must_use]
    pub fn embeddings_only() -> Self {
        Self {
            chat: false,
            embeddings: true,
            parameters: BTreeSet::new(),
        }
    }

    /// Allow an additional parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.insert(name.into());
        self
    }

    /// Check if a capability or parameter is supported
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        match capability {
            "chat" => self.chat,
            "embeddings" => self.embeddings,
            other => self.parameters.contains(other),
        }
    }

    /// Subset of `names` this backend does not accept
    #[must_use]
    pub fn unsupported<'a>(&self, names: &'a [String]) -> Vec<&'a str> {
        names
            .iter()
            .filter(|n| !self.parameters.contains(n.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// Price per thousand tokens, in USD
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per 1k prompt tokens
    pub input_cost_per_1k: f64,
    /// Cost per 1k completion tokens
    pub output_cost_per_1k: f64,
}

impl ModelPricing {
    /// Create a price table entry
    #[must_use]
    pub fn new(input_cost_per_1k: f64, output_cost_per_1k: f64) -> Self {
        Self {
            input_cost_per_1k,
            output_cost_per_1k,
        }
    }

    /// Cost of the given usage
    #[must_use]
    pub fn cost(&self, usage: &Usage) -> f64 {
        f64::from(usage.prompt_tokens) / 1000.0 * self.input_cost_per_1k
            + f64::from(usage.completion_tokens) / 1000.0 * self.output_cost_per_1k
    }
}

/// One concrete routable target
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    /// Unique descriptor id
    pub id: BackendId,
    /// Provider identifier selecting the client implementation
    pub provider: String,
    /// Physical model name sent upstream
    pub model: String,
    /// Base URL
    pub endpoint: String,
    /// Credential reference
    pub credential: CredentialRef,
    /// Throughput limits
    pub limits: RateLimits,
    /// Descriptors to try after this one, in order
    pub fallback_of: Vec<BackendId>,
    /// Accepted capabilities and parameters
    pub capabilities: BackendCapabilities,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Price table used for usage cost
    pub pricing: Option<ModelPricing>,
}

impl BackendDescriptor {
    /// Default per-attempt timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a descriptor with default capabilities and no limits
    #[must_use]
    pub fn new(
        id: BackendId,
        provider: impl Into<String>,
        model: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id,
            provider: provider.into(),
            model: model.into(),
            endpoint: endpoint.into(),
            credential: CredentialRef::None,
            limits: RateLimits::unlimited(),
            fallback_of: Vec::new(),
            capabilities: BackendCapabilities::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            pricing: None,
        }
    }

    /// Set the credential reference
    #[must_use]
    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = credential;
        self
    }

    /// Set rate limits
    #[must_use]
    pub fn with_limits(mut self, limits: RateLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Append a fallback descriptor id
    #[must_use]
    pub fn with_fallback(mut self, id: BackendId) -> Self {
        self.fallback_of.push(id);
        self
    }

    /// Set capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set pricing
    #[must_use]
    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }
}

/// A logical model name mapped to an ordered candidate list.
///
/// The first `primary_count` candidates are equally ranked primaries; the
/// rest form the fallback chain, tried left to right.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    name: ModelName,
    candidates: Vec<Arc<BackendDescriptor>>,
    primary_count: usize,
}

impl ModelRoute {
    /// Create a route
    ///
    /// # Errors
    /// Returns `GatewayError::Config` when there is no primary or a
    /// descriptor appears more than once
    pub fn new(
        name: ModelName,
        primaries: Vec<Arc<BackendDescriptor>>,
        fallbacks: Vec<Arc<BackendDescriptor>>,
    ) -> GatewayResult<Self> {
        if primaries.is_empty() {
            return Err(GatewayError::config(format!("model {name} has no primary backend")));
        }
        let primary_count = primaries.len();
        let candidates: Vec<_> = primaries.into_iter().chain(fallbacks).collect();
        for (i, candidate) in candidates.iter().enumerate() {
            if candidates[..i].iter().any(|c| c.id == candidate.id) {
                return Err(GatewayError::config(format!(
                    "model {name} references backend {} more than once",
                    candidate.id
                )));
            }
        }
        Ok(Self {
            name,
            candidates,
            primary_count,
        })
    }

    /// Logical model name
    #[must_use]
    pub fn name(&self) -> &ModelName {
        &self.name
    }

    /// First configured primary
    #[must_use]
    pub fn primary(&self) -> &Arc<BackendDescriptor> {
        &self.candidates[0]
    }

    /// Equally ranked primaries
    #[must_use]
    pub fn primaries(&self) -> &[Arc<BackendDescriptor>] {
        &self.candidates[..self.primary_count]
    }

    /// Fallback chain after the primaries
    #[must_use]
    pub fn fallbacks(&self) -> &[Arc<BackendDescriptor>] {
        &self.candidates[self.primary_count..]
    }

    /// All candidates in configured order
    #[must_use]
    pub fn candidates(&self) -> &[Arc<BackendDescriptor>] {
        &self.candidates
    }
}
