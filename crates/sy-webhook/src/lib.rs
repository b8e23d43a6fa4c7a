//! Webhook Retry Queue
//!
//! Durable queue of outbound webhook notifications with bounded retries and
//! exponential backoff. A polling scheduler claims due items, delivers each
//! on its own worker task, and either removes the item (delivered),
//! reschedules it (retry budget remaining), or dead-letters it (budget
//! exhausted).

pub mod delivery;
pub mod scheduler;
pub mod signing;

pub use delivery::{DeliveryAttempt, HttpTransport, WebhookTransport};
pub use scheduler::{RetryScheduler, RetrySchedulerConfig, WebhookEvent};
pub use signing::{compute_signature, verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
