//! Utilities for unidb
//!
//! Backoff arithmetic, the retry executor, logging setup and URL helpers.

pub mod backoff;
pub mod logging;
pub mod retry;
pub mod url;

// Re-export key utility types
pub use backoff::BackoffPolicy;
pub use retry::{retry, DelayStrategy, FixedDelay, Retry, RetryError, RetryPolicy};
pub use url::sanitize_url;
