//! Test assertions for persisted job state.

use crate::core::{JobEventKind, JobStatus, StepStatus};
use crate::store::{ExecutionLog, ExecutionStep, Job, JobEvent};

/// Asserts that the job has the expected status.
pub fn assert_job_status(job: &Job, expected: JobStatus) {
    assert_eq!(
        job.status, expected,
        "Expected job status {expected:?}, got {:?} (error: {:?})",
        job.status, job.error
    );
}

/// Asserts the statuses of a job's steps, in step order.
pub fn assert_step_statuses(steps: &[ExecutionStep], expected: &[StepStatus]) {
    let actual: Vec<StepStatus> = steps.iter().map(|s| s.status).collect();
    assert_eq!(actual, expected, "Unexpected step statuses");
}

/// Asserts that log sequence numbers strictly increase.
pub fn assert_log_sequences_increasing(logs: &[ExecutionLog]) {
    assert!(
        logs.windows(2).all(|w| w[0].sequence < w[1].sequence),
        "Log sequences are not strictly increasing: {:?}",
        logs.iter().map(|l| l.sequence).collect::<Vec<_>>()
    );
}

/// Asserts that event sequence numbers strictly increase and the last
/// event is `Complete`.
pub fn assert_event_stream_complete(events: &[JobEvent]) {
    assert!(
        events.windows(2).all(|w| w[0].sequence < w[1].sequence),
        "Event sequences are not strictly increasing"
    );
    assert_eq!(
        events.last().map(|e| e.kind),
        Some(JobEventKind::Complete),
        "Expected the stream to end with a complete event"
    );
}
