//! Retry scheduler.
//!
//! Polls the retry queue on a fixed interval. Each pass recovers expired
//! claims, atomically claims due items (the store guarantees a single winner
//! per item), and delivers each item on its own task bounded by a worker
//! semaphore so a slow endpoint never stalls the rest of the pass.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use uuid::Uuid;

use sy_common::{AuditSink, DeliveryStatus, RetryPolicy, RetryQueueItem, WebhookLog};
use sy_store::{RetryQueueStore, TenantConfigStore, WebhookLogStore};

use crate::delivery::WebhookTransport;

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub poll_interval: Duration,
    /// Max items claimed per pass.
    pub batch_size: u32,
    /// Max concurrent delivery workers.
    pub worker_concurrency: usize,
    /// Delivery timeout when the tenant does not configure one.
    pub default_timeout: Duration,
    /// Delivering claims older than this are returned to Pending.
    pub stuck_claim_timeout: Duration,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            worker_concurrency: 16,
            default_timeout: Duration::from_secs(30),
            stuck_claim_timeout: Duration::from_secs(300),
        }
    }
}

/// An event to notify a tenant about. The scheduler turns this into a
/// Pending queue item due immediately.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub webhook_url: String,
    pub payload: serde_json::Value,
}

pub struct RetryScheduler {
    queue: Arc<dyn RetryQueueStore>,
    logs: Arc<dyn WebhookLogStore>,
    configs: Arc<dyn TenantConfigStore>,
    transport: Arc<dyn WebhookTransport>,
    audit: Arc<dyn AuditSink>,
    config: RetrySchedulerConfig,
    workers: Arc<Semaphore>,
}

impl RetryScheduler {
    pub fn new(
        queue: Arc<dyn RetryQueueStore>,
        logs: Arc<dyn WebhookLogStore>,
        configs: Arc<dyn TenantConfigStore>,
        transport: Arc<dyn WebhookTransport>,
        audit: Arc<dyn AuditSink>,
        config: RetrySchedulerConfig,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.worker_concurrency));
        Arc::new(Self {
            queue,
            logs,
            configs,
            transport,
            audit,
            config,
            workers,
        })
    }

    /// Enqueue an outbound notification. Retry budget comes from the
    /// tenant's webhook policy; system defaults apply when the tenant has
    /// none.
    pub async fn enqueue(&self, event: WebhookEvent) -> Result<String> {
        let policy = self.policy_for(&event.tenant_id).await;
        let now = Utc::now();
        let item = RetryQueueItem {
            id: Uuid::new_v4().to_string(),
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            event_type: event.event_type,
            webhook_url: event.webhook_url,
            payload: event.payload,
            retry_count: 0,
            max_retries: policy.max_retries,
            next_retry_at: now,
            last_error: None,
            status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let id = item.id.clone();
        self.queue.enqueue(item).await?;
        debug!(item_id = %id, "Webhook delivery enqueued");
        Ok(id)
    }

    /// Run the polling loop until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            worker_concurrency = self.config.worker_concurrency,
            "Starting webhook retry scheduler"
        );
        loop {
            if let Err(e) = self.queue.recover_stuck(self.config.stuck_claim_timeout).await {
                error!("Error recovering stuck deliveries: {}", e);
            }
            if let Err(e) = self.process_due().await {
                error!("Error processing due deliveries: {}", e);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One scheduler pass: claim everything due and hand each item to its
    /// own delivery worker. Returns the number of items claimed without
    /// waiting for the deliveries, so a slow endpoint never delays the next
    /// pass. Every worker holds a semaphore permit for its full lifetime.
    pub async fn process_due(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now();
        let items = self.queue.claim_due(now, self.config.batch_size).await?;

        let count = items.len();
        for item in items {
            let scheduler = self.clone();
            let permit = self.workers.clone().acquire_owned().await?;
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = scheduler.attempt(item).await {
                    error!("Delivery attempt failed internally: {}", e);
                }
            });
        }
        Ok(count)
    }

    /// Wait until every in-flight delivery worker has finished. Permits are
    /// acquired before workers are spawned, so once all permits are free the
    /// queue state is settled.
    pub async fn drain(&self) -> Result<()> {
        let permits = self
            .workers
            .acquire_many(self.config.worker_concurrency as u32)
            .await?;
        drop(permits);
        Ok(())
    }

    async fn attempt(&self, item: RetryQueueItem) -> Result<()> {
        let (secret, timeout, policy) = self.tenant_delivery_settings(&item.tenant_id).await;
        let attempt_number = item.retry_count + 1;

        let result = self
            .transport
            .deliver(&item, secret.as_deref(), timeout)
            .await;

        let log = WebhookLog {
            event_id: item.event_id.clone(),
            attempt_number,
            success: result.success,
            response_status: result.response_status,
            response_time_ms: result.response_time_ms,
            error_message: result.error.clone(),
            created_at: Utc::now(),
        };
        self.logs.append(log.clone()).await?;
        self.audit.webhook_delivery(&log);

        if result.success {
            self.queue.mark_delivered(&item.id).await?;
            return Ok(());
        }

        let retry_count = item.retry_count + 1;
        if retry_count >= item.max_retries {
            // Retry budget exhausted: terminal, surfaced to audit, never
            // silently dropped. The stored item keeps the final count.
            self.queue
                .dead_letter(&item.id, retry_count, result.error)
                .await?;
            let mut dead = item;
            dead.retry_count = retry_count;
            dead.status = DeliveryStatus::DeadLettered;
            self.audit.dead_letter(&dead);
        } else {
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(policy.backoff_with_jitter(retry_count))
                    .unwrap_or_else(|_| chrono::Duration::seconds(policy.max_delay_secs as i64));
            self.queue
                .reschedule(&item.id, retry_count, next_retry_at, result.error)
                .await?;
        }
        Ok(())
    }

    async fn policy_for(&self, tenant_id: &str) -> RetryPolicy {
        match self.configs.get(tenant_id).await {
            Ok(Some(config)) => config.webhook.retry,
            _ => RetryPolicy::default(),
        }
    }

    async fn tenant_delivery_settings(
        &self,
        tenant_id: &str,
    ) -> (Option<String>, Duration, RetryPolicy) {
        match self.configs.get(tenant_id).await {
            Ok(Some(config)) => {
                let timeout = config
                    .webhook
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.config.default_timeout);
                (config.webhook.secret, timeout, config.webhook.retry)
            }
            _ => (None, self.config.default_timeout, RetryPolicy::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sy_common::{DispatchAttempt, TenantConfig};
    use sy_store::{
        InMemoryRetryQueueStore, InMemoryTenantConfigStore, InMemoryWebhookLogStore,
    };

    use crate::delivery::DeliveryAttempt;

    struct ScriptedTransport {
        /// Number of attempts that fail before one succeeds.
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn failing(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn deliver(
            &self,
            _item: &RetryQueueItem,
            _secret: Option<&str>,
            _timeout: Duration,
        ) -> DeliveryAttempt {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                DeliveryAttempt::failed(Some(500), Duration::from_millis(5), "HTTP 500")
            } else {
                DeliveryAttempt::succeeded(200, Duration::from_millis(5))
            }
        }
    }

    #[derive(Default)]
    struct CollectingAuditSink {
        dead_letters: Mutex<Vec<RetryQueueItem>>,
    }

    impl AuditSink for CollectingAuditSink {
        fn dispatch_attempt(&self, _attempt: &DispatchAttempt) {}
        fn webhook_delivery(&self, _log: &WebhookLog) {}
        fn dead_letter(&self, item: &RetryQueueItem) {
            self.dead_letters.lock().push(item.clone());
        }
    }

    struct Harness {
        queue: Arc<InMemoryRetryQueueStore>,
        logs: Arc<InMemoryWebhookLogStore>,
        configs: Arc<InMemoryTenantConfigStore>,
        audit: Arc<CollectingAuditSink>,
    }

    impl Harness {
        async fn new() -> Self {
            let configs = Arc::new(InMemoryTenantConfigStore::new());
            // Zero backoff so every retry is due on the next pass.
            let mut config = TenantConfig::new("tenant-1");
            config.webhook.retry = RetryPolicy {
                max_retries: 3,
                base_delay_secs: 0,
                max_delay_secs: 0,
                jitter_ms: 0,
            };
            config.webhook.secret = Some("s3cret".to_string());
            configs.upsert(config).await.unwrap();

            Self {
                queue: Arc::new(InMemoryRetryQueueStore::new()),
                logs: Arc::new(InMemoryWebhookLogStore::new()),
                configs,
                audit: Arc::new(CollectingAuditSink::default()),
            }
        }

        fn scheduler(&self, transport: Arc<dyn WebhookTransport>) -> Arc<RetryScheduler> {
            RetryScheduler::new(
                self.queue.clone(),
                self.logs.clone(),
                self.configs.clone(),
                transport,
                self.audit.clone(),
                RetrySchedulerConfig::default(),
            )
        }

        fn event(&self) -> WebhookEvent {
            WebhookEvent {
                event_id: "evt-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                event_type: "payment.approved".to_string(),
                webhook_url: "http://localhost/hook".to_string(),
                payload: json!({"amount": 1000}),
            }
        }
    }

    #[tokio::test]
    async fn successful_delivery_removes_the_item() {
        let h = Harness::new().await;
        let transport = ScriptedTransport::failing(0);
        let scheduler = h.scheduler(transport.clone());

        let id = scheduler.enqueue(h.event()).await.unwrap();
        assert_eq!(scheduler.process_due().await.unwrap(), 1);
        scheduler.drain().await.unwrap();

        assert_eq!(transport.call_count(), 1);
        assert!(h.queue.get(&id).await.unwrap().is_none());

        let logs = h.logs.for_event("evt-1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn failure_reschedules_with_incremented_count() {
        let h = Harness::new().await;
        let scheduler = h.scheduler(ScriptedTransport::failing(1));

        let id = scheduler.enqueue(h.event()).await.unwrap();
        scheduler.process_due().await.unwrap();
        scheduler.drain().await.unwrap();

        let item = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn item_dead_letters_after_max_retries_and_is_never_retried() {
        let h = Harness::new().await;
        let transport = ScriptedTransport::failing(usize::MAX);
        let scheduler = h.scheduler(transport.clone());

        let id = scheduler.enqueue(h.event()).await.unwrap();

        // max_retries = 3: three failed attempts, then terminal.
        for _ in 0..3 {
            scheduler.process_due().await.unwrap();
            scheduler.drain().await.unwrap();
        }
        assert_eq!(transport.call_count(), 3);

        // The persisted terminal item carries the full attempt history.
        let item = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::DeadLettered);
        assert_eq!(item.retry_count, item.max_retries);

        // A fourth pass attempts nothing.
        assert_eq!(scheduler.process_due().await.unwrap(), 0);
        scheduler.drain().await.unwrap();
        assert_eq!(transport.call_count(), 3);

        assert_eq!(h.audit.dead_letters.lock().len(), 1);
        assert_eq!(h.logs.for_event("evt-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retry_waits_for_backoff_delay() {
        let h = Harness::new().await;
        // Non-zero backoff for this tenant.
        let mut config = TenantConfig::new("tenant-2");
        config.webhook.retry = RetryPolicy {
            max_retries: 3,
            base_delay_secs: 60,
            max_delay_secs: 3_600,
            jitter_ms: 0,
        };
        h.configs.upsert(config).await.unwrap();

        let transport = ScriptedTransport::failing(usize::MAX);
        let scheduler = h.scheduler(transport.clone());

        let mut event = h.event();
        event.tenant_id = "tenant-2".to_string();
        scheduler.enqueue(event).await.unwrap();

        scheduler.process_due().await.unwrap();
        scheduler.drain().await.unwrap();
        assert_eq!(transport.call_count(), 1);

        // Next retry is a minute out, so a second pass finds nothing due.
        assert_eq!(scheduler.process_due().await.unwrap(), 0);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn attempt_numbers_are_sequential_in_the_log() {
        let h = Harness::new().await;
        let scheduler = h.scheduler(ScriptedTransport::failing(2));

        scheduler.enqueue(h.event()).await.unwrap();
        for _ in 0..3 {
            scheduler.process_due().await.unwrap();
            scheduler.drain().await.unwrap();
        }

        let logs = h.logs.for_event("evt-1").await.unwrap();
        let numbers: Vec<u32> = logs.iter().map(|l| l.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(!logs[0].success);
        assert!(!logs[1].success);
        assert!(logs[2].success);
    }

    /// Blocks every delivery until released, so tests can observe the
    /// scheduler between claiming and completion.
    struct GatedTransport {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl WebhookTransport for GatedTransport {
        async fn deliver(
            &self,
            _item: &RetryQueueItem,
            _secret: Option<&str>,
            _timeout: Duration,
        ) -> DeliveryAttempt {
            self.gate.notified().await;
            DeliveryAttempt::succeeded(200, Duration::from_millis(5))
        }
    }

    #[tokio::test]
    async fn in_flight_delivery_does_not_block_the_next_pass() {
        let h = Harness::new().await;
        let gate = Arc::new(tokio::sync::Notify::new());
        let scheduler = h.scheduler(Arc::new(GatedTransport { gate: gate.clone() }));

        let id = scheduler.enqueue(h.event()).await.unwrap();

        // The pass returns while the delivery is still in flight.
        assert_eq!(scheduler.process_due().await.unwrap(), 1);
        let item = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, DeliveryStatus::Delivering);

        // Another pass runs to completion meanwhile without touching the
        // claimed item.
        assert_eq!(scheduler.process_due().await.unwrap(), 0);

        gate.notify_one();
        scheduler.drain().await.unwrap();
        assert!(h.queue.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_without_config_uses_default_policy() {
        let h = Harness::new().await;
        let scheduler = h.scheduler(ScriptedTransport::failing(0));

        let mut event = h.event();
        event.tenant_id = "unknown-tenant".to_string();
        let id = scheduler.enqueue(event).await.unwrap();

        let item = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(item.max_retries, RetryPolicy::default().max_retries);
    }
}
