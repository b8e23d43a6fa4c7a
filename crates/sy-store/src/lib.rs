//! Storage interfaces for tenant configuration, credentials, the webhook
//! retry queue, and the append-only delivery log.
//!
//! Each entity has exactly one writing component: the configuration and
//! credential stores are written by the administrative layer, the retry
//! queue exclusively by the webhook scheduler. The dispatch path only reads.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

use sy_common::{
    Channel, Credential, DeliveryStatus, Provider, RetryQueueItem, ServiceCategory, TenantConfig,
    TenantStatus, WebhookLog,
};

pub use memory::{
    InMemoryCredentialStore, InMemoryRetryQueueStore, InMemoryTenantConfigStore,
    InMemoryWebhookLogStore,
};

#[cfg(feature = "postgres")]
pub use postgres::{
    PostgresCredentialStore, PostgresRetryQueueStore, PostgresTenantConfigStore,
    PostgresWebhookLogStore,
};

#[async_trait]
pub trait TenantConfigStore: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantConfig>>;

    /// Insert or replace a tenant's configuration. Records are never
    /// physically deleted; terminal tenants transition to Suspended.
    async fn upsert(&self, config: TenantConfig) -> Result<()>;

    async fn set_status(&self, tenant_id: &str, status: TenantStatus) -> Result<bool>;

    /// Atomically bump the per-day operation counter for a category and
    /// return the new count. Backs the max-operations-per-day limits.
    async fn increment_daily_usage(
        &self,
        tenant_id: &str,
        category: ServiceCategory,
        day: NaiveDate,
    ) -> Result<u64>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        provider: Provider,
        channel: Channel,
    ) -> Result<Option<Credential>>;

    async fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<Credential>>;

    /// Insert or replace; at most one credential per
    /// (tenant_id, provider, channel).
    async fn upsert(&self, credential: Credential) -> Result<()>;

    /// Activate or deactivate without deletion. Returns false when no such
    /// credential exists.
    async fn set_active(
        &self,
        tenant_id: &str,
        provider: Provider,
        channel: Channel,
        active: bool,
    ) -> Result<bool>;

    /// Explicit removal; the only way a credential is hard-deleted.
    async fn remove(&self, tenant_id: &str, provider: Provider, channel: Channel) -> Result<bool>;
}

#[async_trait]
pub trait RetryQueueStore: Send + Sync {
    async fn enqueue(&self, item: RetryQueueItem) -> Result<()>;

    /// Atomically transition up to `limit` due Pending items to Delivering
    /// and return them. No two concurrent callers may claim the same item.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<RetryQueueItem>>;

    /// Terminal success: the item leaves the live queue.
    async fn mark_delivered(&self, id: &str) -> Result<()>;

    /// Failed attempt with retry budget remaining: back to Pending.
    async fn reschedule(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Terminal failure: retry ceiling reached, never retried again.
    /// Terminal failure. Persists the final retry count so the stored item
    /// reflects the full attempt history.
    async fn dead_letter(&self, id: &str, retry_count: u32, last_error: Option<String>)
        -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<RetryQueueItem>>;

    async fn list_dead_letters(&self, tenant_id: Option<&str>) -> Result<Vec<RetryQueueItem>>;

    async fn pending_count(&self) -> Result<u64>;

    /// Return Delivering items whose claim is older than `older_than` to
    /// Pending, so a crashed worker cannot strand an item.
    async fn recover_stuck(&self, older_than: Duration) -> Result<u64>;
}

#[async_trait]
pub trait WebhookLogStore: Send + Sync {
    /// Append-only; one record per delivery attempt, never mutated.
    async fn append(&self, log: WebhookLog) -> Result<()>;

    async fn for_event(&self, event_id: &str) -> Result<Vec<WebhookLog>>;
}

/// True when the item may be handed to a delivery worker.
pub fn is_claimable(item: &RetryQueueItem, now: DateTime<Utc>) -> bool {
    item.status == DeliveryStatus::Pending && item.next_retry_at <= now
}
