//! Outbound HTTP delivery of webhook notifications.

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::debug;

use sy_common::RetryQueueItem;

use crate::signing::{compute_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Result of one delivery attempt. Non-2xx responses, timeouts, and
/// connection errors are all failures; 4xx responses are retried like any
/// other failure.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub success: bool,
    pub response_status: Option<u16>,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl DeliveryAttempt {
    pub fn succeeded(status: u16, elapsed: Duration) -> Self {
        Self {
            success: true,
            response_status: Some(status),
            response_time_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    pub fn failed(status: Option<u16>, elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_status: status,
            response_time_ms: elapsed.as_millis() as u64,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(
        &self,
        item: &RetryQueueItem,
        secret: Option<&str>,
        timeout: Duration,
    ) -> DeliveryAttempt;
}

/// Real transport: POST the payload as JSON to the tenant's registered URL,
/// signing with the per-tenant secret when one is configured.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(
        &self,
        item: &RetryQueueItem,
        secret: Option<&str>,
        timeout: Duration,
    ) -> DeliveryAttempt {
        let body = match serde_json::to_vec(&item.payload) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryAttempt::failed(
                    None,
                    Duration::ZERO,
                    format!("payload serialization failed: {}", e),
                )
            }
        };

        let mut request = self
            .client
            .post(&item.webhook_url)
            .header("Content-Type", "application/json")
            .timeout(timeout);

        if let Some(secret) = secret {
            let timestamp = Utc::now().timestamp().to_string();
            let signature = compute_signature(secret.as_bytes(), &body, &timestamp);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        let started = Instant::now();
        match request.body(body).send().await {
            Ok(response) => {
                let elapsed = started.elapsed();
                let status = response.status();
                if status.is_success() {
                    debug!(
                        event_id = %item.event_id,
                        status = status.as_u16(),
                        "Webhook accepted"
                    );
                    DeliveryAttempt::succeeded(status.as_u16(), elapsed)
                } else {
                    DeliveryAttempt::failed(
                        Some(status.as_u16()),
                        elapsed,
                        format!("HTTP {}", status),
                    )
                }
            }
            Err(e) => {
                let elapsed = started.elapsed();
                let error = if e.is_timeout() {
                    format!("timed out after {}ms", timeout.as_millis())
                } else {
                    e.to_string()
                };
                DeliveryAttempt::failed(None, elapsed, error)
            }
        }
    }
}
