//! Testing utilities for mapflow strategies.
//!
//! This module provides:
//! - Mock actions (succeeding, failing, flaky, recording)
//! - An in-memory engine fixture and sample strategies
//! - Assertions over persisted job state

mod assertions;
mod fixtures;
mod mocks;

pub use crate::events::CollectingEventSink;
pub use assertions::{
    assert_event_stream_complete, assert_job_status, assert_log_sequences_increasing,
    assert_step_statuses,
};
pub use fixtures::{mock_strategy, reconcile_strategy, TestEngine};
pub use mocks::{
    factory_of, CallCounter, FailingAction, FlakyAction, MockAction, RecordingAction, SneakyAction,
};
