//! Provider Resolver
//!
//! Produces the ordered candidate list for a (tenant, category) pair:
//! default provider first, then fallback, each included only when an active
//! credential with its required fields exists. Full credential validation is
//! deferred to the dispatch executor's error handling.

use std::sync::Arc;
use tracing::debug;

use sy_common::{Credential, Provider, ServiceCategory, TenantConfig};
use sy_store::{CredentialStore, TenantConfigStore};
use sy_validation::has_required_fields;

use crate::{DispatchError, Result};

/// A (provider, credential) pair considered during resolution.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Provider,
    pub credential: Credential,
}

pub struct ProviderResolver {
    configs: Arc<dyn TenantConfigStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl ProviderResolver {
    pub fn new(
        configs: Arc<dyn TenantConfigStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            configs,
            credentials,
        }
    }

    /// Resolve against a fresh config snapshot. Fails fast with
    /// `NoViableProvider` when the candidate list is empty.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        category: ServiceCategory,
    ) -> Result<Vec<Candidate>> {
        let config = self
            .configs
            .get(tenant_id)
            .await?
            .ok_or_else(|| DispatchError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        self.resolve_for_config(&config, category).await
    }

    /// Resolve against an already-loaded config snapshot, so one dispatch
    /// decision never mixes two versions of the tenant's settings.
    pub async fn resolve_for_config(
        &self,
        config: &TenantConfig,
        category: ServiceCategory,
    ) -> Result<Vec<Candidate>> {
        let settings = config.settings.for_category(category);
        let mut candidates = Vec::with_capacity(2);

        for provider in [settings.default_provider, settings.fallback_provider]
            .into_iter()
            .flatten()
        {
            // Default and fallback may be configured identically; the
            // executor never tries the same candidate twice.
            if candidates
                .iter()
                .any(|c: &Candidate| c.provider == provider)
            {
                continue;
            }

            if provider.category() != category {
                debug!(
                    tenant_id = %config.tenant_id,
                    provider = %provider,
                    category = %category,
                    "Configured provider belongs to another category, skipping"
                );
                continue;
            }

            let credential = self
                .credentials
                .get(&config.tenant_id, provider, provider.channel())
                .await?;

            match credential {
                Some(credential)
                    if credential.is_active
                        && has_required_fields(provider, &credential.payload) =>
                {
                    candidates.push(Candidate {
                        provider,
                        credential,
                    });
                }
                Some(_) => debug!(
                    tenant_id = %config.tenant_id,
                    provider = %provider,
                    "Credential inactive or missing required fields, skipping"
                ),
                None => debug!(
                    tenant_id = %config.tenant_id,
                    provider = %provider,
                    "No credential registered, skipping"
                ),
            }
        }

        if candidates.is_empty() {
            return Err(DispatchError::NoViableProvider {
                tenant_id: config.tenant_id.clone(),
                category,
            });
        }

        Ok(candidates)
    }
}
