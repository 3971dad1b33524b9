//! Strategy interpreter: the per-job step loop and its retry policy.
//!
//! This module provides:
//! - [`JobRunner`], which drives a job through its validated strategy
//! - Retry configuration with backoff and jitter between step attempts

mod retry;
mod runner;

pub use retry::{
    backoff, should_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState,
};
pub use runner::{JobOutcome, JobRunner, StartPoint};
