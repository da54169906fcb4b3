//! Request normalization and capability checks.
//!
//! Normalization runs before fingerprinting so that a request spelling out
//! a default and one omitting it hash identically. Capability checks run
//! against the resolved route: parameters a backend does not accept are
//! either stripped per candidate with an audit entry, or reject the call.

use gateway_config::{GatewayConfig, UnsupportedParamPolicy};
use gateway_core::{
    BackendCall, BackendDescriptor, CompletionRequest, EmbeddingRequest, GatewayError, GatewayResult, MaxTokens,
    ModelRoute, Temperature,
};
use std::borrow::Cow;
use tracing::warn;

/// Gateway-wide request defaults and parameter policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestNormalizer {
    temperature: Temperature,
    max_tokens: MaxTokens,
    policy: UnsupportedParamPolicy,
}

impl Default for RequestNormalizer {
    fn default() -> Self {
        Self {
            temperature: Temperature::default(),
            max_tokens: MaxTokens::default(),
            policy: UnsupportedParamPolicy::default(),
        }
    }
}

impl RequestNormalizer {
    /// Create a normalizer
    #[must_use]
    pub fn new(temperature: Temperature, max_tokens: MaxTokens, policy: UnsupportedParamPolicy) -> Self {
        Self {
            temperature,
            max_tokens,
            policy,
        }
    }

    /// Build from the `defaults` and `routing` sections
    ///
    /// # Errors
    /// Returns `GatewayError::Config` when a default is out of range
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let temperature = config
            .defaults
            .temperature()
            .map_err(|e| GatewayError::config(format!("defaults.temperature: {e}")))?;
        let max_tokens = config
            .defaults
            .max_tokens()
            .map_err(|e| GatewayError::config(format!("defaults.max_tokens: {e}")))?;
        Ok(Self::new(temperature, max_tokens, config.routing.unsupported_params))
    }

    /// Unsupported-parameter policy
    #[must_use]
    pub fn policy(&self) -> UnsupportedParamPolicy {
        self.policy
    }

    /// Validate a completion request and fill unset sampling parameters
    ///
    /// # Errors
    /// Returns `GatewayError::RequestRejected` for a structurally invalid request
    pub fn completion(&self, mut request: CompletionRequest) -> GatewayResult<CompletionRequest> {
        request.validate()?;
        request.apply_defaults(self.temperature, self.max_tokens);
        Ok(request)
    }

    /// Validate an embedding request
    ///
    /// # Errors
    /// Returns `GatewayError::RequestRejected` when there is nothing to embed
    pub fn embedding(&self, request: EmbeddingRequest) -> GatewayResult<EmbeddingRequest> {
        request.validate()?;
        Ok(request)
    }

    /// Check that the route can serve `call` under the configured policy.
    ///
    /// At least one candidate must serve the call's mode. In reject mode,
    /// every serving candidate must accept every parameter the caller set.
    ///
    /// # Errors
    /// Returns `GatewayError::RequestRejected` naming the offending parameter
    pub fn check_route(&self, route: &ModelRoute, call: &BackendCall) -> GatewayResult<()> {
        let capability = call.required_capability();
        let serving: Vec<_> = route
            .candidates()
            .iter()
            .filter(|c| c.capabilities.supports(capability))
            .collect();
        if serving.is_empty() {
            return Err(GatewayError::rejected(
                format!("model {} has no backend serving {capability}", route.name()),
                None,
            ));
        }

        if self.policy == UnsupportedParamPolicy::Reject {
            let names = call.parameter_names();
            for candidate in serving {
                if let Some(name) = candidate.capabilities.unsupported(&names).first() {
                    return Err(GatewayError::rejected(
                        format!("parameter {name} is not supported by backend {}", candidate.id),
                        Some((*name).to_string()),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Whether `candidate` can serve the call's mode at all
#[must_use]
pub fn serves(candidate: &BackendDescriptor, call: &BackendCall) -> bool {
    candidate.capabilities.supports(call.required_capability())
}

/// The call as it should be sent to `candidate`, without the parameters the
/// candidate does not accept. Each removal is logged.
#[must_use]
pub fn prepare_for<'a>(call: &'a BackendCall, candidate: &BackendDescriptor) -> Cow<'a, BackendCall> {
    let names = call.parameter_names();
    let unsupported = candidate.capabilities.unsupported(&names);
    if unsupported.is_empty() {
        return Cow::Borrowed(call);
    }

    let mut stripped = call.clone();
    for name in &unsupported {
        stripped.remove_parameter(name);
    }
    warn!(
        backend = %candidate.id,
        parameters = ?unsupported,
        "Stripped parameters the backend does not accept"
    );
    Cow::Owned(stripped)
}
