//! PostgreSQL store implementations.
//!
//! Schema matches the logical layout: tenant configs keyed by tenant_id,
//! credentials by (tenant_id, provider, channel), the retry queue by id with
//! an index on (status, next_retry_at) for scheduler scans, and webhook logs
//! keyed by (event_id, attempt_number). Timestamps are stored as epoch
//! milliseconds.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

use sy_common::{
    Channel, Credential, DeliveryStatus, Provider, RetryQueueItem, ServiceCategory, TenantConfig,
    TenantStatus, WebhookLog,
};

use crate::{CredentialStore, RetryQueueStore, TenantConfigStore, WebhookLogStore};

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    // One statement per query; the extended protocol rejects batches.
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS tenant_configs (
            tenant_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            config TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_daily_usage (
            tenant_id TEXT NOT NULL,
            category TEXT NOT NULL,
            day DATE NOT NULL,
            op_count BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, category, day)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            tenant_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            channel TEXT NOT NULL,
            payload TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            PRIMARY KEY (tenant_id, provider, channel)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS webhook_retry_queue (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            webhook_url TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            next_retry_at BIGINT NOT NULL,
            last_error TEXT,
            status TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_retry_queue_due
            ON webhook_retry_queue(status, next_retry_at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS webhook_logs (
            event_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            success BOOLEAN NOT NULL,
            response_status INTEGER,
            response_time_ms BIGINT NOT NULL,
            error_message TEXT,
            created_at BIGINT NOT NULL,
            PRIMARY KEY (event_id, attempt_number)
        )
        "#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn status_str(status: DeliveryStatus) -> &'static str {
    status.as_str()
}

fn parse_delivery_status(s: &str) -> Result<DeliveryStatus> {
    match s {
        "PENDING" => Ok(DeliveryStatus::Pending),
        "DELIVERING" => Ok(DeliveryStatus::Delivering),
        "DELIVERED" => Ok(DeliveryStatus::Delivered),
        "DEAD_LETTERED" => Ok(DeliveryStatus::DeadLettered),
        other => Err(anyhow::anyhow!("unknown delivery status: {}", other)),
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow::anyhow!("invalid timestamp: {}", ms))
}

fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<RetryQueueItem> {
    Ok(RetryQueueItem {
        id: row.get("id"),
        event_id: row.get("event_id"),
        tenant_id: row.get("tenant_id"),
        event_type: row.get("event_type"),
        webhook_url: row.get("webhook_url"),
        payload: serde_json::from_str(row.get("payload"))?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        next_retry_at: millis_to_datetime(row.get("next_retry_at"))?,
        last_error: row.get("last_error"),
        status: parse_delivery_status(row.get("status"))?,
        created_at: millis_to_datetime(row.get("created_at"))?,
        updated_at: millis_to_datetime(row.get("updated_at"))?,
    })
}

pub struct PostgresTenantConfigStore {
    pool: PgPool,
}

impl PostgresTenantConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantConfigStore for PostgresTenantConfigStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<TenantConfig>> {
        let row = sqlx::query("SELECT config FROM tenant_configs WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.get("config"))?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, mut config: TenantConfig) -> Result<()> {
        config.updated_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO tenant_configs (tenant_id, status, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id)
            DO UPDATE SET status = $2, config = $3, updated_at = $5
            "#,
        )
        .bind(&config.tenant_id)
        .bind(config.status.as_str())
        .bind(serde_json::to_string(&config)?)
        .bind(config.created_at.timestamp_millis())
        .bind(config.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, tenant_id: &str, status: TenantStatus) -> Result<bool> {
        let Some(mut config) = self.get(tenant_id).await? else {
            return Ok(false);
        };
        config.status = status;
        self.upsert(config).await?;
        Ok(true)
    }

    async fn increment_daily_usage(
        &self,
        tenant_id: &str,
        category: ServiceCategory,
        day: NaiveDate,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO tenant_daily_usage (tenant_id, category, day, op_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (tenant_id, category, day)
            DO UPDATE SET op_count = tenant_daily_usage.op_count + 1
            RETURNING op_count
            "#,
        )
        .bind(tenant_id)
        .bind(category.as_str())
        .bind(day)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("op_count") as u64)
    }
}

pub struct PostgresCredentialStore {
    pool: PgPool,
}

impl PostgresCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_credential(row: &sqlx::postgres::PgRow) -> Result<Credential> {
    let provider: String = row.get("provider");
    let channel: String = row.get("channel");
    Ok(Credential {
        tenant_id: row.get("tenant_id"),
        provider: provider
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?,
        channel: Channel::parse(&channel)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", channel))?,
        payload: serde_json::from_str(row.get("payload"))?,
        is_active: row.get("is_active"),
        created_at: millis_to_datetime(row.get("created_at"))?,
        updated_at: millis_to_datetime(row.get("updated_at"))?,
    })
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn get(
        &self,
        tenant_id: &str,
        provider: Provider,
        channel: Channel,
    ) -> Result<Option<Credential>> {
        let row = sqlx::query(
            "SELECT * FROM credentials WHERE tenant_id = $1 AND provider = $2 AND channel = $3",
        )
        .bind(tenant_id)
        .bind(provider.as_str())
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_credential).transpose()
    }

    async fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<Credential>> {
        let rows = sqlx::query("SELECT * FROM credentials WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_credential).collect()
    }

    async fn upsert(&self, mut credential: Credential) -> Result<()> {
        credential.updated_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO credentials
                (tenant_id, provider, channel, payload, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, provider, channel)
            DO UPDATE SET payload = $4, is_active = $5, updated_at = $7
            "#,
        )
        .bind(&credential.tenant_id)
        .bind(credential.provider.as_str())
        .bind(credential.channel.as_str())
        .bind(serde_json::to_string(&credential.payload)?)
        .bind(credential.is_active)
        .bind(credential.created_at.timestamp_millis())
        .bind(credential.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_active(
        &self,
        tenant_id: &str,
        provider: Provider,
        channel: Channel,
        active: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials SET is_active = $4, updated_at = $5
            WHERE tenant_id = $1 AND provider = $2 AND channel = $3
            "#,
        )
        .bind(tenant_id)
        .bind(provider.as_str())
        .bind(channel.as_str())
        .bind(active)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, tenant_id: &str, provider: Provider, channel: Channel) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM credentials WHERE tenant_id = $1 AND provider = $2 AND channel = $3",
        )
        .bind(tenant_id)
        .bind(provider.as_str())
        .bind(channel.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct PostgresRetryQueueStore {
    pool: PgPool,
}

impl PostgresRetryQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryQueueStore for PostgresRetryQueueStore {
    async fn enqueue(&self, item: RetryQueueItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_retry_queue
                (id, event_id, tenant_id, event_type, webhook_url, payload,
                 retry_count, max_retries, next_retry_at, last_error, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&item.id)
        .bind(&item.event_id)
        .bind(&item.tenant_id)
        .bind(&item.event_type)
        .bind(&item.webhook_url)
        .bind(serde_json::to_string(&item.payload)?)
        .bind(item.retry_count as i32)
        .bind(item.max_retries as i32)
        .bind(item.next_retry_at.timestamp_millis())
        .bind(&item.last_error)
        .bind(status_str(item.status))
        .bind(item.created_at.timestamp_millis())
        .bind(item.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<RetryQueueItem>> {
        // FOR UPDATE SKIP LOCKED makes the Pending -> Delivering transition
        // single-winner across concurrent schedulers.
        let rows = sqlx::query(
            r#"
            UPDATE webhook_retry_queue
            SET status = 'DELIVERING', updated_at = $1
            WHERE id IN (
                SELECT id FROM webhook_retry_queue
                WHERE status = 'PENDING' AND next_retry_at <= $1
                ORDER BY next_retry_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_retry_queue
            SET status = 'PENDING', retry_count = $2, next_retry_at = $3,
                last_error = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(next_retry_at.timestamp_millis())
        .bind(last_error)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: &str,
        retry_count: u32,
        last_error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_retry_queue
            SET status = 'DEAD_LETTERED', retry_count = $2, last_error = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(last_error)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<RetryQueueItem>> {
        let row = sqlx::query("SELECT * FROM webhook_retry_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn list_dead_letters(&self, tenant_id: Option<&str>) -> Result<Vec<RetryQueueItem>> {
        let rows = match tenant_id {
            Some(tenant) => {
                sqlx::query(
                    "SELECT * FROM webhook_retry_queue WHERE status = 'DEAD_LETTERED' AND tenant_id = $1",
                )
                .bind(tenant)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM webhook_retry_queue WHERE status = 'DEAD_LETTERED'")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_item).collect()
    }

    async fn pending_count(&self) -> Result<u64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM webhook_retry_queue WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn recover_stuck(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE webhook_retry_queue
            SET status = 'PENDING'
            WHERE status = 'DELIVERING' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Recovered {} stuck retry queue items (PostgreSQL)", recovered);
        }
        Ok(recovered)
    }
}

pub struct PostgresWebhookLogStore {
    pool: PgPool,
}

impl PostgresWebhookLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLogStore for PostgresWebhookLogStore {
    async fn append(&self, log: WebhookLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_logs
                (event_id, attempt_number, success, response_status,
                 response_time_ms, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&log.event_id)
        .bind(log.attempt_number as i32)
        .bind(log.success)
        .bind(log.response_status.map(|s| s as i32))
        .bind(log.response_time_ms as i64)
        .bind(&log.error_message)
        .bind(log.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_event(&self, event_id: &str) -> Result<Vec<WebhookLog>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_logs WHERE event_id = $1 ORDER BY attempt_number",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(WebhookLog {
                    event_id: row.get("event_id"),
                    attempt_number: row.get::<i32, _>("attempt_number") as u32,
                    success: row.get("success"),
                    response_status: row
                        .get::<Option<i32>, _>("response_status")
                        .map(|s| s as u16),
                    response_time_ms: row.get::<i64, _>("response_time_ms") as u64,
                    error_message: row.get("error_message"),
                    created_at: millis_to_datetime(row.get("created_at"))?,
                })
            })
            .collect()
    }
}
