//! Backend client pool.
//!
//! Maps provider identifiers to the client that speaks their wire format.
//! Descriptors name a provider; the executor resolves the client here on
//! every attempt, so clients can be added while the gateway is serving.

use crate::openai_compatible::{OpenAiCompatibleBackend, OPENAI_COMPATIBLE_PROVIDERS};
use dashmap::DashMap;
use gateway_core::{BackendDescriptor, BackendError, ErrorClass, GatewayError, GatewayResult, LlmBackend};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Provider-keyed set of backend clients
#[derive(Default)]
pub struct BackendPool {
    clients: DashMap<String, Arc<dyn LlmBackend>>,
}

impl BackendPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with one OpenAI-compatible client registered under
    /// every OpenAI-compatible provider name
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn with_openai_compatible(connect_timeout: Duration) -> GatewayResult<Self> {
        let pool = Self::new();
        for provider in OPENAI_COMPATIBLE_PROVIDERS {
            let client = OpenAiCompatibleBackend::new(*provider, connect_timeout)?;
            pool.register(Arc::new(client))?;
        }
        Ok(pool)
    }

    /// Register a client under the provider it reports
    ///
    /// # Errors
    /// Returns error if the provider is already registered
    pub fn register(&self, backend: Arc<dyn LlmBackend>) -> GatewayResult<()> {
        let provider = backend.provider().to_string();
        self.register_as(provider, backend)
    }

    /// Register a client under an explicit provider name
    ///
    /// # Errors
    /// Returns error if the provider is already registered
    pub fn register_as(&self, provider: impl Into<String>, backend: Arc<dyn LlmBackend>) -> GatewayResult<()> {
        let provider = provider.into();
        match self.clients.entry(provider.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::config(format!(
                "Backend client already registered for provider: {provider}"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(backend);
                info!(provider = %provider, "Backend client registered");
                Ok(())
            }
        }
    }

    /// Replace or insert the client for a provider
    pub fn replace(&self, provider: impl Into<String>, backend: Arc<dyn LlmBackend>) -> Option<Arc<dyn LlmBackend>> {
        self.clients.insert(provider.into(), backend)
    }

    /// Client for a provider
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<dyn LlmBackend>> {
        self.clients.get(provider).map(|c| Arc::clone(c.value()))
    }

    /// Client for a provider, as a classified failure when missing
    ///
    /// # Errors
    /// Returns a permanent `UnknownProvider` error when no client is registered
    pub fn resolve(&self, provider: &str) -> Result<Arc<dyn LlmBackend>, BackendError> {
        self.get(provider).ok_or_else(|| {
            BackendError::permanent(
                ErrorClass::UnknownProvider,
                format!("no backend client registered for provider {provider}"),
            )
        })
    }

    /// Providers named by `descriptors` that have no client
    #[must_use]
    pub fn missing_providers<'a, I>(&self, descriptors: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a BackendDescriptor>,
    {
        descriptors
            .into_iter()
            .filter(|d| !self.clients.contains_key(&d.provider))
            .map(|d| d.provider.clone())
            .collect()
    }

    /// Registered provider names, sorted
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no provider is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("providers", &self.providers())
            .finish()
    }
}
