//! Utility modules for orgflow-core
//!
//! - retry: Backoff curves for naks, fetch pauses, reconnects and
//!   one-shot retries

mod retry;

pub use retry::{retry_with_backoff, RetryConfig};
