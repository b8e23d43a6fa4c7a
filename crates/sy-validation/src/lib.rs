//! Validation Gate
//!
//! Pure, stateless checks applied to tenant configuration fragments and
//! credential bags before they may be activated or used for dispatch.
//! Validation is advisory: errors make a report invalid, but callers decide
//! whether to reject the write.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use sy_common::{MessagingProvider, Provider, ServiceCategory};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("email regex")
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("url regex"));

// Phone formats vary too much across countries to hard-fail; a mismatch is a
// warning. Accepts E.164-style numbers with an optional leading +.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9][0-9]{6,14}$").expect("phone regex"));

/// Result of validating a configuration fragment or credential bag.
/// Errors imply `is_valid = false`; warnings never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.is_valid = false;
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Fields a provider's credential bag must carry before activation, and
/// fields that are recommended but not required.
struct FieldRules {
    required: &'static [&'static str],
    recommended: &'static [&'static str],
}

fn field_rules(provider: Provider) -> FieldRules {
    match provider {
        Provider::Messaging(MessagingProvider::Twilio) => FieldRules {
            required: &["accountSid", "authToken"],
            recommended: &["fromNumber"],
        },
        Provider::Messaging(MessagingProvider::Meta) => FieldRules {
            required: &["accessToken", "phoneNumberId"],
            recommended: &[],
        },
        Provider::Messaging(MessagingProvider::Sendgrid)
        | Provider::Messaging(MessagingProvider::Resend) => FieldRules {
            required: &["apiKey"],
            recommended: &["fromEmail"],
        },
        Provider::Payments(_) => FieldRules {
            required: &["apiKey", "secretKey"],
            recommended: &[],
        },
        Provider::Delivery(_) => FieldRules {
            required: &["apiKey"],
            recommended: &[],
        },
    }
}

fn has_non_empty(bag: &Value, field: &str) -> bool {
    matches!(bag.get(field), Some(Value::String(s)) if !s.is_empty())
}

/// Cheap required-field check used by the provider resolver. Full format
/// validation is deferred to the dispatch executor's error handling.
pub fn has_required_fields(provider: Provider, payload: &Value) -> bool {
    field_rules(provider)
        .required
        .iter()
        .all(|f| has_non_empty(payload, f))
}

/// Validate a credential bag against a provider's field rules.
pub fn validate_credentials(
    category: ServiceCategory,
    provider: &str,
    credentials: &Value,
) -> ValidationReport {
    let mut report = ValidationReport::new();

    let Some(provider) = Provider::parse(category, provider) else {
        report.error(format!(
            "unknown {} provider: {}",
            category, provider
        ));
        return report;
    };

    let rules = field_rules(provider);
    for field in rules.required {
        if !has_non_empty(credentials, field) {
            report.error(format!(
                "{}: missing required credential field '{}'",
                provider, field
            ));
        }
    }
    for field in rules.recommended {
        if !has_non_empty(credentials, field) {
            report.warning(format!(
                "{}: recommended credential field '{}' is not set",
                provider, field
            ));
        }
    }

    report
}

/// A proposed update to one category's service settings, as submitted by the
/// administrative layer. Provider identifiers arrive as free text and are
/// resolved against the category's enumerated set here, once.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub default_provider: Option<String>,
    pub fallback_provider: Option<String>,
    pub retry_attempts: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub from_email: Option<String>,
    pub from_phone: Option<String>,
    pub webhook_url: Option<String>,
}

const TIMEOUT_WARN_MIN_MS: u64 = 5_000;
const TIMEOUT_WARN_MAX_MS: u64 = 120_000;

fn retry_range(category: ServiceCategory) -> (u32, u32) {
    match category {
        ServiceCategory::Messaging => (1, 10),
        ServiceCategory::Payments | ServiceCategory::Delivery => (1, 5),
    }
}

/// Validate a settings fragment for one service category.
pub fn validate_settings(category: ServiceCategory, update: &SettingsUpdate) -> ValidationReport {
    let mut report = ValidationReport::new();

    for (label, value) in [
        ("defaultProvider", &update.default_provider),
        ("fallbackProvider", &update.fallback_provider),
    ] {
        if let Some(name) = value {
            if Provider::parse(category, name).is_none() {
                report.error(format!(
                    "{}: unknown {} provider '{}'",
                    label, category, name
                ));
            }
        }
    }

    if let Some(attempts) = update.retry_attempts {
        let (min, max) = retry_range(category);
        if attempts < min || attempts > max {
            report.error(format!(
                "retryAttempts must be between {} and {} for {}, got {}",
                min, max, category, attempts
            ));
        }
    }

    // Out-of-band timeouts are allowed but flagged.
    if let Some(timeout) = update.timeout_ms {
        if !(TIMEOUT_WARN_MIN_MS..=TIMEOUT_WARN_MAX_MS).contains(&timeout) {
            report.warning(format!(
                "timeoutMs {} is outside the recommended {}..{} ms range",
                timeout, TIMEOUT_WARN_MIN_MS, TIMEOUT_WARN_MAX_MS
            ));
        }
    }

    if let Some(email) = update.from_email.as_deref() {
        if !EMAIL_RE.is_match(email) {
            report.error(format!("fromEmail '{}' is not a valid email address", email));
        }
    }

    if let Some(url) = update.webhook_url.as_deref() {
        if !URL_RE.is_match(url) {
            report.error(format!("webhookUrl '{}' is not a valid http(s) URL", url));
        }
    }

    if let Some(phone) = update.from_phone.as_deref() {
        if !PHONE_RE.is_match(phone) {
            report.warning(format!("fromPhone '{}' does not look like an international number", phone));
        }
    }

    report
}
