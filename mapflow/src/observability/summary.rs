//! Wide summary records of finished jobs.

use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

use crate::store::{ExecutionStep, Job};

/// Builds one record describing a job and every step it ran.
#[must_use]
pub fn job_summary(job: &Job, steps: &[ExecutionStep]) -> serde_json::Value {
    let mut step_counts: BTreeMap<String, u32> = BTreeMap::new();
    for step in steps {
        *step_counts.entry(step.status.to_string()).or_insert(0) += 1;
    }

    let step_details: Vec<serde_json::Value> = steps
        .iter()
        .map(|step| {
            let mut detail = json!({
                "step": step.step_name,
                "step_index": step.step_index,
                "action_type": step.action_type,
                "status": step.status.to_string(),
                "duration_ms": step.duration_ms,
                "retry_count": step.retry_count,
                "records_processed": step.metrics.records_processed,
            });
            if let Some(kind) = &step.error_kind {
                detail["error_kind"] = json!(kind);
            }
            detail
        })
        .collect();

    let duration_ms = match (job.started_at, job.completed_at) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
        _ => None,
    };

    json!({
        "job_id": job.id.to_string(),
        "strategy": job.strategy_name,
        "strategy_version": job.strategy_version,
        "status": job.status.to_string(),
        "progress": job.progress(),
        "retry_count": job.retry_count,
        "duration_ms": duration_ms,
        "records_processed": job.resource_usage.records_processed,
        "checkpoints_written": job.resource_usage.checkpoints_written,
        "error_kind": job.error.as_ref().and_then(|e| e.detail.get("kind").cloned()),
        "step_counts": step_counts,
        "step_details": step_details,
    })
}

/// Logs [`job_summary`] as a single `info` event.
pub fn log_job_summary(job: &Job, steps: &[ExecutionStep]) {
    let summary = job_summary(job, steps);
    info!(
        job_id = %job.id,
        status = %job.status,
        summary = %summary,
        "Job summary"
    );
}
