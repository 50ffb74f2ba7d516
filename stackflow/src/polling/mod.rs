//! Bounded waiting and transport-level retries.
//!
//! This module provides:
//! - `with_retry`, which absorbs transient backend errors with backoff and jitter
//! - `wait_until`, the poll → sleep-with-backoff → re-poll primitive shared by
//!   the stack reconciler and the workflow engine

mod retry;
mod wait;

pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig, Transient};
pub use wait::{wait_until, PollConfig, WaitOutcome};
