//! Provider adapter capability interface.
//!
//! One adapter exists per concrete provider (Twilio, Stripe, Uber, ...).
//! The core is polymorphic over this trait and never sees provider-specific
//! wire formats.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use sy_common::{Credential, Provider};

/// Failure modes an adapter may signal. Anything else an adapter does is its
/// own concern; per-provider retry in particular belongs inside the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("credentials rejected: {0}")]
    CredentialRejected(String),

    #[error("provider call timed out")]
    Timeout,
}

/// Response returned by a successful provider call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Provider-assigned identifier for the accepted operation, when one
    /// exists.
    pub provider_reference: Option<String>,
    pub raw: Value,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn send(
        &self,
        credential: &Credential,
        payload: &Value,
    ) -> std::result::Result<ProviderResponse, AdapterError>;
}

/// Registry of adapters keyed by provider, populated at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).map(|a| Arc::clone(a.value()))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
