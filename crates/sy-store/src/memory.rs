//! In-memory store implementations for embedded deployments and tests.
//!
//! Keyed maps use `DashMap`; the retry queue keeps all items behind a single
//! mutex so the Pending -> Delivering transition is a true compare-and-swap.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use sy_common::{
    Channel, Credential, DeliveryStatus, Provider, RetryQueueItem, ServiceCategory, TenantConfig,
    TenantStatus, WebhookLog,
};

use crate::{CredentialStore, RetryQueueStore, TenantConfigStore, WebhookLogStore};

#[derive(Default)]
pub struct InMemoryTenantConfigStore {
    configs: DashMap<String, TenantConfig>,
    usage: DashMap<(String, ServiceCategory, NaiveDate), u64>,
}

impl InMemoryTenantConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantConfigStore for InMemoryTenantConfigStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantConfig>> {
        Ok(self.configs.get(tenant_id).map(|c| c.clone()))
    }

    async fn upsert(&self, mut config: TenantConfig) -> Result<()> {
        config.updated_at = Utc::now();
        self.configs.insert(config.tenant_id.clone(), config);
        Ok(())
    }

    async fn set_status(&self, tenant_id: &str, status: TenantStatus) -> Result<bool> {
        match self.configs.get_mut(tenant_id) {
            Some(mut config) => {
                config.status = status;
                config.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_daily_usage(
        &self,
        tenant_id: &str,
        category: ServiceCategory,
        day: NaiveDate,
    ) -> Result<u64> {
        let mut count = self
            .usage
            .entry((tenant_id.to_string(), category, day))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: DashMap<(String, Provider, Channel), Credential>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(
        &self,
        tenant_id: &str,
        provider: Provider,
        channel: Channel,
    ) -> Result<Option<Credential>> {
        Ok(self
            .credentials
            .get(&(tenant_id.to_string(), provider, channel))
            .map(|c| c.clone()))
    }

    async fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<Credential>> {
        Ok(self
            .credentials
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn upsert(&self, mut credential: Credential) -> Result<()> {
        credential.updated_at = Utc::now();
        let key = (
            credential.tenant_id.clone(),
            credential.provider,
            credential.channel,
        );
        self.credentials.insert(key, credential);
        Ok(())
    }

    async fn set_active(
        &self,
        tenant_id: &str,
        provider: Provider,
        channel: Channel,
        active: bool,
    ) -> Result<bool> {
        match self
            .credentials
            .get_mut(&(tenant_id.to_string(), provider, channel))
        {
            Some(mut credential) => {
                credential.is_active = active;
                credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, tenant_id: &str, provider: Provider, channel: Channel) -> Result<bool> {
        Ok(self
            .credentials
            .remove(&(tenant_id.to_string(), provider, channel))
            .is_some())
    }
}

#[derive(Default)]
pub struct InMemoryRetryQueueStore {
    items: Mutex<HashMap<String, RetryQueueItem>>,
}

impl InMemoryRetryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryQueueStore for InMemoryRetryQueueStore {
    async fn enqueue(&self, item: RetryQueueItem) -> Result<()> {
        self.items.lock().insert(item.id.clone(), item);
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<RetryQueueItem>> {
        let mut items = self.items.lock();

        let mut due: Vec<(DateTime<Utc>, String)> = items
            .values()
            .filter(|item| crate::is_claimable(item, now))
            .map(|item| (item.next_retry_at, item.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(item) = items.get_mut(&id) {
                item.status = DeliveryStatus::Delivering;
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        // Success removes the item from the live queue entirely.
        self.items.lock().remove(id);
        Ok(())
    }

    async fn reschedule(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        if let Some(item) = self.items.lock().get_mut(id) {
            item.status = DeliveryStatus::Pending;
            item.retry_count = retry_count;
            item.next_retry_at = next_retry_at;
            item.last_error = last_error;
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: &str,
        retry_count: u32,
        last_error: Option<String>,
    ) -> Result<()> {
        if let Some(item) = self.items.lock().get_mut(id) {
            item.status = DeliveryStatus::DeadLettered;
            item.retry_count = retry_count;
            item.last_error = last_error;
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<RetryQueueItem>> {
        Ok(self.items.lock().get(id).cloned())
    }

    async fn list_dead_letters(&self, tenant_id: Option<&str>) -> Result<Vec<RetryQueueItem>> {
        Ok(self
            .items
            .lock()
            .values()
            .filter(|item| item.status == DeliveryStatus::DeadLettered)
            .filter(|item| tenant_id.map_or(true, |t| item.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self
            .items
            .lock()
            .values()
            .filter(|item| item.status == DeliveryStatus::Pending)
            .count() as u64)
    }

    async fn recover_stuck(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut recovered = 0;
        for item in self.items.lock().values_mut() {
            if item.status == DeliveryStatus::Delivering && item.updated_at < cutoff {
                item.status = DeliveryStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered stuck retry queue items");
        }
        Ok(recovered)
    }
}

#[derive(Default)]
pub struct InMemoryWebhookLogStore {
    logs: Mutex<Vec<WebhookLog>>,
}

impl InMemoryWebhookLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookLogStore for InMemoryWebhookLogStore {
    async fn append(&self, log: WebhookLog) -> Result<()> {
        self.logs.lock().push(log);
        Ok(())
    }

    async fn for_event(&self, event_id: &str) -> Result<Vec<WebhookLog>> {
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| log.event_id == event_id)
            .cloned()
            .collect())
    }
}
