use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Service Categories & Providers
// ============================================================================

/// Class of operation routed to an external provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    Messaging,
    Payments,
    Delivery,
}

impl ServiceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::Messaging => "messaging",
            ServiceCategory::Payments => "payments",
            ServiceCategory::Delivery => "delivery",
        }
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel a credential is scoped to. Messaging providers each
/// serve exactly one channel; payments and delivery providers use their
/// category-wide channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Whatsapp,
    Email,
    Payment,
    Delivery,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
            Channel::Email => "email",
            Channel::Payment => "payment",
            Channel::Delivery => "delivery",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "sms" => Some(Channel::Sms),
            "whatsapp" => Some(Channel::Whatsapp),
            "email" => Some(Channel::Email),
            "payment" => Some(Channel::Payment),
            "delivery" => Some(Channel::Delivery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingProvider {
    Twilio,
    Meta,
    Sendgrid,
    Resend,
}

impl MessagingProvider {
    pub fn channel(&self) -> Channel {
        match self {
            MessagingProvider::Twilio => Channel::Sms,
            MessagingProvider::Meta => Channel::Whatsapp,
            MessagingProvider::Sendgrid | MessagingProvider::Resend => Channel::Email,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentsProvider {
    Mercadopago,
    Transbank,
    Stripe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryProvider {
    Uber,
    Rappi,
    PedidosYa,
}

/// A concrete third-party provider, tagged by the service category it
/// implements. Provider identifiers are parsed once when configuration is
/// validated; dispatch never re-parses strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Messaging(MessagingProvider),
    Payments(PaymentsProvider),
    Delivery(DeliveryProvider),
}

impl Provider {
    pub fn category(&self) -> ServiceCategory {
        match self {
            Provider::Messaging(_) => ServiceCategory::Messaging,
            Provider::Payments(_) => ServiceCategory::Payments,
            Provider::Delivery(_) => ServiceCategory::Delivery,
        }
    }

    /// Channel a credential for this provider must be registered under.
    pub fn channel(&self) -> Channel {
        match self {
            Provider::Messaging(p) => p.channel(),
            Provider::Payments(_) => Channel::Payment,
            Provider::Delivery(_) => Channel::Delivery,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Messaging(MessagingProvider::Twilio) => "twilio",
            Provider::Messaging(MessagingProvider::Meta) => "meta",
            Provider::Messaging(MessagingProvider::Sendgrid) => "sendgrid",
            Provider::Messaging(MessagingProvider::Resend) => "resend",
            Provider::Payments(PaymentsProvider::Mercadopago) => "mercadopago",
            Provider::Payments(PaymentsProvider::Transbank) => "transbank",
            Provider::Payments(PaymentsProvider::Stripe) => "stripe",
            Provider::Delivery(DeliveryProvider::Uber) => "uber",
            Provider::Delivery(DeliveryProvider::Rappi) => "rappi",
            Provider::Delivery(DeliveryProvider::PedidosYa) => "pedidosya",
        }
    }

    /// Parse a provider identifier within a service category. Returns `None`
    /// for identifiers that do not belong to the category's enumerated set.
    pub fn parse(category: ServiceCategory, s: &str) -> Option<Provider> {
        let provider = match (category, s) {
            (ServiceCategory::Messaging, "twilio") => Provider::Messaging(MessagingProvider::Twilio),
            (ServiceCategory::Messaging, "meta") => Provider::Messaging(MessagingProvider::Meta),
            (ServiceCategory::Messaging, "sendgrid") => {
                Provider::Messaging(MessagingProvider::Sendgrid)
            }
            (ServiceCategory::Messaging, "resend") => Provider::Messaging(MessagingProvider::Resend),
            (ServiceCategory::Payments, "mercadopago") => {
                Provider::Payments(PaymentsProvider::Mercadopago)
            }
            (ServiceCategory::Payments, "transbank") => {
                Provider::Payments(PaymentsProvider::Transbank)
            }
            (ServiceCategory::Payments, "stripe") => Provider::Payments(PaymentsProvider::Stripe),
            (ServiceCategory::Delivery, "uber") => Provider::Delivery(DeliveryProvider::Uber),
            (ServiceCategory::Delivery, "rappi") => Provider::Delivery(DeliveryProvider::Rappi),
            (ServiceCategory::Delivery, "pedidosya") => {
                Provider::Delivery(DeliveryProvider::PedidosYa)
            }
            _ => return None,
        };
        Some(provider)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ServiceCategory::Messaging,
            ServiceCategory::Payments,
            ServiceCategory::Delivery,
        ]
        .iter()
        .find_map(|c| Provider::parse(*c, s))
        .ok_or_else(|| format!("unknown provider: {}", s))
    }
}

// Provider identifiers are unique across categories, so the wire format is
// just the lowercase name.
impl Serialize for Provider {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tenant Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    /// Terminal state. Suspended tenants are never physically deleted.
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Suspended => "suspended",
        }
    }
}

/// Per-category routing and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    pub default_provider: Option<Provider>,
    pub fallback_provider: Option<Provider>,
    pub retry_attempts: u32,
    pub timeout_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_provider: None,
            fallback_provider: None,
            retry_attempts: 3,
            timeout_ms: 30_000,
        }
    }
}

impl ServiceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub messaging: ServiceSettings,
    #[serde(default)]
    pub payments: ServiceSettings,
    #[serde(default)]
    pub delivery: ServiceSettings,
}

impl TenantSettings {
    pub fn for_category(&self, category: ServiceCategory) -> &ServiceSettings {
        match category {
            ServiceCategory::Messaging => &self.messaging,
            ServiceCategory::Payments => &self.payments,
            ServiceCategory::Delivery => &self.delivery,
        }
    }

    pub fn for_category_mut(&mut self, category: ServiceCategory) -> &mut ServiceSettings {
        match category {
            ServiceCategory::Messaging => &mut self.messaging,
            ServiceCategory::Payments => &mut self.payments,
            ServiceCategory::Delivery => &mut self.delivery,
        }
    }
}

/// Maximum operations per day, per category. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantLimits {
    pub max_messages_per_day: Option<u64>,
    pub max_payments_per_day: Option<u64>,
    pub max_deliveries_per_day: Option<u64>,
}

impl TenantLimits {
    pub fn for_category(&self, category: ServiceCategory) -> Option<u64> {
        match category {
            ServiceCategory::Messaging => self.max_messages_per_day,
            ServiceCategory::Payments => self.max_payments_per_day,
            ServiceCategory::Delivery => self.max_deliveries_per_day,
        }
    }
}

/// Outbound webhook delivery policy for a tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPolicy {
    /// Secret for HMAC-SHA256 signature headers.
    pub secret: Option<String>,
    /// Per-attempt delivery timeout; the scheduler default applies when
    /// unset.
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub tenant_id: String,
    pub status: TenantStatus,
    pub settings: TenantSettings,
    pub limits: TenantLimits,
    pub webhook: WebhookPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantConfig {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            status: TenantStatus::Active,
            settings: TenantSettings::default(),
            limits: TenantLimits::default(),
            webhook: WebhookPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Per-tenant, per-provider, per-channel credential record. At most one
/// credential exists per (tenant_id, provider, channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub tenant_id: String,
    pub provider: Provider,
    pub channel: Channel,
    /// Opaque provider-specific key/value bag.
    pub payload: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(tenant_id: impl Into<String>, provider: Provider, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            channel: provider.channel(),
            provider,
            payload,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the payload carries a non-empty string for `field`.
    pub fn has_field(&self, field: &str) -> bool {
        matches!(self.payload.get(field), Some(serde_json::Value::String(s)) if !s.is_empty())
    }
}

// ============================================================================
// Dispatch Audit Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Success,
    /// Provider unavailable, timed out, or returned a transient error.
    ProviderError,
    /// Provider rejected the credential.
    CredentialInvalid,
}

/// One record per candidate tried during a single logical dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAttempt {
    pub tenant_id: String,
    pub category: ServiceCategory,
    pub provider: Provider,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Webhook Retry Queue Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Delivered,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivering => "DELIVERING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::DeadLettered => "DEAD_LETTERED",
        }
    }
}

/// Durable record of a pending webhook delivery.
///
/// Invariant: `retry_count <= max_retries`. An item whose attempt fails with
/// `retry_count == max_retries` is dead-lettered and never retried again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQueueItem {
    pub id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub webhook_url: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of a single delivery attempt. Written once, never
/// mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLog {
    pub event_id: String,
    pub attempt_number: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Retry / Backoff Policy
// ============================================================================

/// Exponential backoff with a capped maximum delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Extra random delay added on top of the deterministic schedule.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 30,
            max_delay_secs: 3_600,
            jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay before retry number `retry_count` (1-based).
    /// Monotonically non-decreasing and capped at `max_delay_secs`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let secs = self
            .base_delay_secs
            .saturating_mul(multiplier)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Backoff plus jitter; used when scheduling the actual retry.
    pub fn backoff_with_jitter(&self, retry_count: u32) -> Duration {
        let base = self.backoff(retry_count);
        if self.jitter_ms == 0 {
            return base;
        }
        use rand::Rng;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
    }
}

// ============================================================================
// Audit Sink
// ============================================================================

/// Records dispatch decisions, retries, and terminal outcomes. Passed into
/// components by explicit construction; there is no ambient global sink.
pub trait AuditSink: Send + Sync {
    fn dispatch_attempt(&self, attempt: &DispatchAttempt);
    fn webhook_delivery(&self, log: &WebhookLog);
    fn dead_letter(&self, item: &RetryQueueItem);
}

/// Structured-logging sink backed by `tracing` and `metrics` counters.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn dispatch_attempt(&self, attempt: &DispatchAttempt) {
        metrics::counter!(
            "sy_dispatch_attempts_total",
            "category" => attempt.category.as_str(),
            "provider" => attempt.provider.as_str(),
        )
        .increment(1);

        match attempt.outcome {
            AttemptOutcome::Success => tracing::info!(
                tenant_id = %attempt.tenant_id,
                category = %attempt.category,
                provider = %attempt.provider,
                duration_ms = attempt.duration_ms,
                "Dispatch succeeded"
            ),
            _ => tracing::warn!(
                tenant_id = %attempt.tenant_id,
                category = %attempt.category,
                provider = %attempt.provider,
                outcome = ?attempt.outcome,
                error = ?attempt.error,
                "Dispatch attempt failed"
            ),
        }
    }

    fn webhook_delivery(&self, log: &WebhookLog) {
        metrics::counter!(
            "sy_webhook_attempts_total",
            "success" => if log.success { "true" } else { "false" },
        )
        .increment(1);

        if log.success {
            tracing::info!(
                event_id = %log.event_id,
                attempt = log.attempt_number,
                response_time_ms = log.response_time_ms,
                "Webhook delivered"
            );
        } else {
            tracing::warn!(
                event_id = %log.event_id,
                attempt = log.attempt_number,
                response_status = ?log.response_status,
                error = ?log.error_message,
                "Webhook delivery failed"
            );
        }
    }

    fn dead_letter(&self, item: &RetryQueueItem) {
        metrics::counter!("sy_webhook_dead_letters_total").increment(1);
        tracing::error!(
            event_id = %item.event_id,
            tenant_id = %item.tenant_id,
            retry_count = item.retry_count,
            error = ?item.last_error,
            "Webhook dead-lettered after exhausting retries"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_respects_category() {
        assert_eq!(
            Provider::parse(ServiceCategory::Payments, "stripe"),
            Some(Provider::Payments(PaymentsProvider::Stripe))
        );
        // stripe is not a messaging provider
        assert_eq!(Provider::parse(ServiceCategory::Messaging, "stripe"), None);
        assert_eq!(Provider::parse(ServiceCategory::Payments, "twilio"), None);
        assert_eq!(Provider::parse(ServiceCategory::Delivery, "pedidosya"),
            Some(Provider::Delivery(DeliveryProvider::PedidosYa)));
    }

    #[test]
    fn provider_roundtrips_through_serde() {
        let p = Provider::Payments(PaymentsProvider::Mercadopago);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"mercadopago\"");
        let back: Provider = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn messaging_providers_map_to_their_channel() {
        assert_eq!(Provider::Messaging(MessagingProvider::Twilio).channel(), Channel::Sms);
        assert_eq!(Provider::Messaging(MessagingProvider::Meta).channel(), Channel::Whatsapp);
        assert_eq!(Provider::Messaging(MessagingProvider::Resend).channel(), Channel::Email);
        assert_eq!(Provider::Payments(PaymentsProvider::Stripe).channel(), Channel::Payment);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_retries: 6,
            base_delay_secs: 30,
            max_delay_secs: 300,
            jitter_ms: 0,
        };

        let mut previous = Duration::ZERO;
        for n in 1..=policy.max_retries {
            let delay = policy.backoff(n);
            assert!(delay >= previous, "backoff({}) decreased", n);
            assert!(delay <= Duration::from_secs(300));
            previous = delay;
        }
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(5), Duration::from_secs(300));
    }

    #[test]
    fn backoff_survives_large_retry_counts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(3_600));
    }
}
