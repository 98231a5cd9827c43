//! Retry state machine and orchestration.

mod backoff;
mod manager;
mod unit;

pub use backoff::{BackoffPolicy, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF};
pub use manager::{RetryError, RetryHandle, RetryManager, RetryOutcome, RetryableOperation};
pub use unit::{RetryDecision, RetrySnapshot, RetryStatus, RetryUnit};
