//! Dispatch Executor
//!
//! Walks the resolver's ordered candidate list, invoking one provider
//! adapter at a time under the tenant's configured timeout. Fallback is
//! across providers, never within one: a candidate is tried at most once per
//! logical request. Every candidate tried emits exactly one audit record.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use sy_common::{
    AttemptOutcome, AuditSink, DispatchAttempt, Provider, ServiceCategory, TenantConfig,
};
use sy_store::TenantConfigStore;

use crate::adapter::{AdapterError, AdapterRegistry, ProviderResponse};
use crate::resolver::{Candidate, ProviderResolver};
use crate::{DispatchError, Result};

/// Successful dispatch, attributed to the provider that accepted it.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub provider: Provider,
    pub response: ProviderResponse,
    /// One entry per candidate tried, the last being the success.
    pub attempts: Vec<DispatchAttempt>,
}

pub struct DispatchExecutor {
    configs: Arc<dyn TenantConfigStore>,
    resolver: ProviderResolver,
    registry: Arc<AdapterRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl DispatchExecutor {
    pub fn new(
        configs: Arc<dyn TenantConfigStore>,
        resolver: ProviderResolver,
        registry: Arc<AdapterRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            configs,
            resolver,
            registry,
            audit,
        }
    }

    pub async fn dispatch(
        &self,
        tenant_id: &str,
        category: ServiceCategory,
        payload: &Value,
    ) -> Result<DispatchOutcome> {
        let config = self
            .configs
            .get(tenant_id)
            .await?
            .ok_or_else(|| DispatchError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?;

        if !config.is_active() {
            return Err(DispatchError::TenantNotActive {
                tenant_id: tenant_id.to_string(),
                status: config.status,
            });
        }

        self.check_daily_limit(&config, category).await?;

        let candidates = self.resolver.resolve_for_config(&config, category).await?;
        let timeout = config.settings.for_category(category).timeout();

        let mut attempts = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let started = Instant::now();
            let result = self.try_candidate(&candidate, payload, timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (outcome, error, response) = match result {
                Ok(response) => (AttemptOutcome::Success, None, Some(response)),
                Err(AdapterError::CredentialRejected(e)) => {
                    (AttemptOutcome::CredentialInvalid, Some(e), None)
                }
                Err(AdapterError::Unavailable(e)) => {
                    (AttemptOutcome::ProviderError, Some(e), None)
                }
                Err(AdapterError::Timeout) => (
                    AttemptOutcome::ProviderError,
                    Some(format!("timed out after {}ms", timeout.as_millis())),
                    None,
                ),
            };

            let attempt = DispatchAttempt {
                tenant_id: tenant_id.to_string(),
                category,
                provider: candidate.provider,
                outcome,
                error,
                duration_ms,
                created_at: Utc::now(),
            };
            self.audit.dispatch_attempt(&attempt);
            attempts.push(attempt);

            if let Some(response) = response {
                debug!(
                    tenant_id = %tenant_id,
                    category = %category,
                    provider = %candidate.provider,
                    candidates_tried = attempts.len(),
                    "Dispatch succeeded"
                );
                return Ok(DispatchOutcome {
                    provider: candidate.provider,
                    response,
                    attempts,
                });
            }

            warn!(
                tenant_id = %tenant_id,
                category = %category,
                provider = %candidate.provider,
                "Candidate failed, advancing to next"
            );
        }

        Err(DispatchError::AllProvidersFailed { attempts })
    }

    async fn try_candidate(
        &self,
        candidate: &Candidate,
        payload: &Value,
        timeout: std::time::Duration,
    ) -> std::result::Result<ProviderResponse, AdapterError> {
        let adapter = self.registry.get(candidate.provider).ok_or_else(|| {
            AdapterError::Unavailable(format!(
                "no adapter registered for {}",
                candidate.provider
            ))
        })?;

        // A call that outlives the tenant's timeout is a failure for
        // fallback purposes, never left pending.
        match tokio::time::timeout(timeout, adapter.send(&candidate.credential, payload)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }

    async fn check_daily_limit(
        &self,
        config: &TenantConfig,
        category: ServiceCategory,
    ) -> Result<()> {
        let Some(limit) = config.limits.for_category(category) else {
            return Ok(());
        };

        let count = self
            .configs
            .increment_daily_usage(&config.tenant_id, category, Utc::now().date_naive())
            .await?;

        if count > limit {
            return Err(DispatchError::DailyLimitExceeded {
                tenant_id: config.tenant_id.clone(),
                category,
                limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sy_common::{
        Credential, PaymentsProvider, RetryQueueItem, TenantStatus, WebhookLog,
    };
    use sy_store::{
        CredentialStore, InMemoryCredentialStore, InMemoryTenantConfigStore, TenantConfigStore,
    };

    const MERCADOPAGO: Provider = Provider::Payments(PaymentsProvider::Mercadopago);
    const TRANSBANK: Provider = Provider::Payments(PaymentsProvider::Transbank);

    #[derive(Default)]
    struct CollectingAuditSink {
        attempts: Mutex<Vec<DispatchAttempt>>,
    }

    impl AuditSink for CollectingAuditSink {
        fn dispatch_attempt(&self, attempt: &DispatchAttempt) {
            self.attempts.lock().push(attempt.clone());
        }
        fn webhook_delivery(&self, _log: &WebhookLog) {}
        fn dead_letter(&self, _item: &RetryQueueItem) {}
    }

    enum Script {
        Succeed,
        Unavailable,
        RejectCredential,
        Hang,
    }

    struct ScriptedAdapter {
        provider: Provider,
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(provider: Provider, script: Script) -> Arc<Self> {
            Arc::new(Self {
                provider,
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl crate::ProviderAdapter for ScriptedAdapter {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn send(
            &self,
            _credential: &Credential,
            _payload: &Value,
        ) -> std::result::Result<ProviderResponse, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Succeed => Ok(ProviderResponse {
                    provider_reference: Some("ref-1".to_string()),
                    raw: json!({"status": "accepted"}),
                }),
                Script::Unavailable => {
                    Err(AdapterError::Unavailable("503 from provider".to_string()))
                }
                Script::RejectCredential => {
                    Err(AdapterError::CredentialRejected("bad api key".to_string()))
                }
                Script::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    unreachable!("call should have timed out")
                }
            }
        }
    }

    struct Harness {
        configs: Arc<InMemoryTenantConfigStore>,
        credentials: Arc<InMemoryCredentialStore>,
        registry: Arc<AdapterRegistry>,
        audit: Arc<CollectingAuditSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                configs: Arc::new(InMemoryTenantConfigStore::new()),
                credentials: Arc::new(InMemoryCredentialStore::new()),
                registry: Arc::new(AdapterRegistry::new()),
                audit: Arc::new(CollectingAuditSink::default()),
            }
        }

        async fn tenant(&self, default: Option<Provider>, fallback: Option<Provider>) {
            let mut config = sy_common::TenantConfig::new("tenant-1");
            config.settings.payments.default_provider = default;
            config.settings.payments.fallback_provider = fallback;
            config.settings.payments.timeout_ms = 200;
            self.configs.upsert(config).await.unwrap();
        }

        async fn credential(&self, provider: Provider) {
            self.credentials
                .upsert(Credential::new(
                    "tenant-1",
                    provider,
                    json!({"apiKey": "k", "secretKey": "s"}),
                ))
                .await
                .unwrap();
        }

        fn executor(&self) -> DispatchExecutor {
            DispatchExecutor::new(
                self.configs.clone(),
                ProviderResolver::new(self.configs.clone(), self.credentials.clone()),
                self.registry.clone(),
                self.audit.clone(),
            )
        }
    }

    #[tokio::test]
    async fn fallback_succeeds_when_default_fails() {
        let h = Harness::new();
        h.tenant(Some(MERCADOPAGO), Some(TRANSBANK)).await;
        h.credential(MERCADOPAGO).await;
        h.credential(TRANSBANK).await;

        let failing = ScriptedAdapter::new(MERCADOPAGO, Script::Unavailable);
        let succeeding = ScriptedAdapter::new(TRANSBANK, Script::Succeed);
        h.registry.register(failing.clone());
        h.registry.register(succeeding.clone());

        let outcome = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({"amount": 1000}))
            .await
            .unwrap();

        assert_eq!(outcome.provider, TRANSBANK);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::ProviderError);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Success);
        assert_eq!(failing.call_count(), 1);
        assert_eq!(succeeding.call_count(), 1);
        assert_eq!(h.audit.attempts.lock().len(), 2);
    }

    #[tokio::test]
    async fn no_credentials_fails_fast_without_adapter_calls() {
        let h = Harness::new();
        h.tenant(Some(MERCADOPAGO), Some(TRANSBANK)).await;

        let adapter = ScriptedAdapter::new(MERCADOPAGO, Script::Succeed);
        h.registry.register(adapter.clone());

        let err = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NoViableProvider { .. }));
        assert_eq!(adapter.call_count(), 0);
        assert!(h.audit.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_reports_every_candidate_outcome() {
        let h = Harness::new();
        h.tenant(Some(MERCADOPAGO), Some(TRANSBANK)).await;
        h.credential(MERCADOPAGO).await;
        h.credential(TRANSBANK).await;

        h.registry
            .register(ScriptedAdapter::new(MERCADOPAGO, Script::RejectCredential));
        h.registry
            .register(ScriptedAdapter::new(TRANSBANK, Script::Unavailable));

        let err = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
            .await
            .unwrap_err();

        let DispatchError::AllProvidersFailed { attempts } = err else {
            panic!("expected AllProvidersFailed, got {:?}", err);
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::CredentialInvalid);
        assert_eq!(attempts[1].outcome, AttemptOutcome::ProviderError);
    }

    #[tokio::test]
    async fn default_with_credential_succeeds_on_first_attempt() {
        let h = Harness::new();
        // mercadopago has a credential, transbank does not
        h.tenant(Some(MERCADOPAGO), Some(TRANSBANK)).await;
        h.credential(MERCADOPAGO).await;

        let adapter = ScriptedAdapter::new(MERCADOPAGO, Script::Succeed);
        h.registry.register(adapter.clone());

        let outcome = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({"amount": 500}))
            .await
            .unwrap();

        assert_eq!(outcome.provider, MERCADOPAGO);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Success);
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn slow_adapter_counts_as_provider_error() {
        let h = Harness::new();
        h.tenant(Some(MERCADOPAGO), None).await;
        h.credential(MERCADOPAGO).await;
        h.registry
            .register(ScriptedAdapter::new(MERCADOPAGO, Script::Hang));

        let err = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
            .await
            .unwrap_err();

        let DispatchError::AllProvidersFailed { attempts } = err else {
            panic!("expected AllProvidersFailed, got {:?}", err);
        };
        assert_eq!(attempts[0].outcome, AttemptOutcome::ProviderError);
        assert!(attempts[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn suspended_tenant_is_rejected_before_resolution() {
        let h = Harness::new();
        h.tenant(Some(MERCADOPAGO), None).await;
        h.credential(MERCADOPAGO).await;
        h.configs
            .set_status("tenant-1", TenantStatus::Suspended)
            .await
            .unwrap();

        let adapter = ScriptedAdapter::new(MERCADOPAGO, Script::Succeed);
        h.registry.register(adapter.clone());

        let err = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::TenantNotActive { .. }));
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn daily_limit_rejects_after_cap() {
        let h = Harness::new();
        let mut config = sy_common::TenantConfig::new("tenant-1");
        config.settings.payments.default_provider = Some(MERCADOPAGO);
        config.limits.max_payments_per_day = Some(2);
        h.configs.upsert(config).await.unwrap();
        h.credential(MERCADOPAGO).await;
        h.registry
            .register(ScriptedAdapter::new(MERCADOPAGO, Script::Succeed));

        let executor = h.executor();
        for _ in 0..2 {
            executor
                .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
                .await
                .unwrap();
        }

        let err = executor
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DailyLimitExceeded { limit: 2, .. }
        ));
    }

    #[tokio::test]
    async fn inactive_credential_excludes_the_candidate() {
        let h = Harness::new();
        h.tenant(Some(MERCADOPAGO), Some(TRANSBANK)).await;
        h.credential(MERCADOPAGO).await;
        h.credential(TRANSBANK).await;
        h.credentials
            .set_active("tenant-1", MERCADOPAGO, MERCADOPAGO.channel(), false)
            .await
            .unwrap();

        let fallback = ScriptedAdapter::new(TRANSBANK, Script::Succeed);
        h.registry.register(fallback.clone());

        let outcome = h
            .executor()
            .dispatch("tenant-1", ServiceCategory::Payments, &json!({}))
            .await
            .unwrap();

        assert_eq!(outcome.provider, TRANSBANK);
        assert_eq!(outcome.attempts.len(), 1);
    }
}
