//! Dispatch Error Types

use thiserror::Error;

use sy_common::{DispatchAttempt, ServiceCategory, TenantStatus};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: String },

    #[error("Tenant {tenant_id} is not active (status: {status:?})")]
    TenantNotActive {
        tenant_id: String,
        status: TenantStatus,
    },

    #[error("Daily {category} limit of {limit} reached for tenant {tenant_id}")]
    DailyLimitExceeded {
        tenant_id: String,
        category: ServiceCategory,
        limit: u64,
    },

    /// No configured provider has an active credential carrying its required
    /// fields. Not retried here: retrying would re-derive the same empty
    /// candidate list.
    #[error("No viable {category} provider for tenant {tenant_id}")]
    NoViableProvider {
        tenant_id: String,
        category: ServiceCategory,
    },

    /// Every candidate was tried once and failed. Carries the per-candidate
    /// outcomes for diagnostics.
    #[error("All {} candidate provider(s) failed", attempts.len())]
    AllProvidersFailed { attempts: Vec<DispatchAttempt> },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}
