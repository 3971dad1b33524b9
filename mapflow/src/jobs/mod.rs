//! Job service.
//!
//! This module provides:
//! - [`JobService`], which submits strategies as jobs on a bounded worker pool
//! - Status queries against the store, cancellation and resume
//! - Per-job event streams that replay history and follow live events

mod service;

pub use service::JobService;
