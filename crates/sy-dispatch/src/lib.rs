//! Provider resolution and dispatch execution.
//!
//! Given a tenant and a service category, the resolver produces the ordered
//! candidate list (default then fallback, filtered to active credentials
//! carrying their required fields) and the executor walks it, calling one
//! provider adapter at a time until one succeeds or the list is exhausted.

pub mod adapter;
pub mod executor;
pub mod resolver;

mod error;

pub use adapter::{AdapterError, AdapterRegistry, ProviderAdapter, ProviderResponse};
pub use error::DispatchError;
pub use executor::{DispatchExecutor, DispatchOutcome};
pub use resolver::{Candidate, ProviderResolver};

pub type Result<T> = std::result::Result<T, DispatchError>;
