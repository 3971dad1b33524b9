//! The per-job control loop.
//!
//! A [`JobRunner`] drives one job through its strategy: it claims the job,
//! validates the strategy, then runs each step in order, committing the
//! step row, logs, events, progress and post-step checkpoint together.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::retry::{backoff, should_retry, RetryConfig, RetryDecision, RetryState};
use crate::actions::ActionRegistry;
use crate::cancellation::CancellationToken;
use crate::checkpoint::CheckpointManager;
use crate::context::{ExecutionContext, ScopedContext};
use crate::core::{ActionResult, CheckpointKind, JobEventKind, JobStatus, LogLevel, StepStatus};
use crate::errors::{ActionError, CheckpointError, MapflowError};
use crate::events::{EventSink, NoOpEventSink};
use crate::store::{
    ExecutionCheckpoint, ExecutionLog, ExecutionStep, Job, JobError, JobEvent, JobId, JobStore,
    ResultStorage, SequenceHeads, StepCommit,
};
use crate::strategy::{validate_strategy, PlannedStep, StrategyDefinition, StrategyPlan, TemplateResolver};

/// Where a run starts.
#[derive(Debug, Clone)]
pub enum StartPoint {
    /// First run, from step 0 with the job's initial datasets.
    Fresh(ExecutionContext),
    /// Resume from a restored context.
    Resume {
        /// Context restored from a checkpoint.
        context: ExecutionContext,
        /// First step to run.
        next_step: usize,
    },
}

/// The job record and context when a run ends.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The job as last persisted.
    pub job: Job,
    /// The context after the last step that ran.
    pub context: ExecutionContext,
}

impl JobOutcome {
    /// Final status of the job.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
}

enum StepOutcome {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

/// Buffers logs and events with their per-job sequence numbers until the
/// next commit.
struct Journal {
    job_id: JobId,
    next_log: u64,
    next_event: u64,
    logs: Vec<ExecutionLog>,
    events: Vec<JobEvent>,
}

impl Journal {
    fn new(job_id: JobId, heads: SequenceHeads) -> Self {
        Self {
            job_id,
            next_log: heads.next_log,
            next_event: heads.next_event,
            logs: Vec::new(),
            events: Vec::new(),
        }
    }

    fn log(
        &mut self,
        level: LogLevel,
        step_index: Option<usize>,
        message: impl Into<String>,
        detail: Option<serde_json::Value>,
    ) {
        self.logs.push(ExecutionLog {
            job_id: self.job_id,
            sequence: self.next_log,
            level,
            message: message.into(),
            detail,
            step_index,
            category: if step_index.is_some() { "step" } else { "job" }.to_string(),
            component: "interpreter".to_string(),
            timestamp: Utc::now(),
        });
        self.next_log += 1;
    }

    fn event(&mut self, kind: JobEventKind, payload: serde_json::Value) {
        self.events
            .push(JobEvent::new(self.job_id, self.next_event, kind, payload));
        self.next_event += 1;
    }

    fn status_change(&mut self, from: JobStatus, to: JobStatus) {
        self.event(JobEventKind::StatusChange, json!({ "from": from, "to": to }));
    }

    fn drain(&mut self) -> (Vec<ExecutionLog>, Vec<JobEvent>) {
        (std::mem::take(&mut self.logs), std::mem::take(&mut self.events))
    }
}

fn progress_payload(job: &Job, step: &ExecutionStep) -> serde_json::Value {
    json!({
        "step": step.step_name,
        "step_index": step.step_index,
        "status": step.status,
        "current_step_index": job.current_step_index,
        "total_steps": job.total_steps,
        "progress": job.progress(),
    })
}

/// Names the failing step and error class. Dataset contents stay out.
fn error_detail(step: &ExecutionStep, err: &MapflowError) -> serde_json::Value {
    json!({
        "step": step.step_name,
        "step_index": step.step_index,
        "action_type": step.action_type,
        "kind": err.kind(),
    })
}

fn record_error(step: &mut ExecutionStep, err: &MapflowError) {
    step.error = Some(err.to_string());
    step.error_kind = Some(err.kind().to_string());
    step.can_retry = err.is_retryable();
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Executes jobs step by step.
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<ActionRegistry>,
    store: Arc<dyn JobStore>,
    checkpoints: CheckpointManager,
    sink: Arc<dyn EventSink>,
    retry: RetryConfig,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("registry", &self.registry)
            .field("checkpoints", &self.checkpoints)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// Creates a runner that emits no events.
    #[must_use]
    pub fn new(
        registry: Arc<ActionRegistry>,
        store: Arc<dyn JobStore>,
        checkpoints: CheckpointManager,
    ) -> Self {
        Self {
            registry,
            store,
            checkpoints,
            sink: Arc::new(NoOpEventSink),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the sink committed events are forwarded to.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the delay between step attempts.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Runs a job until it completes, fails or is cancelled.
    ///
    /// A strategy that fails validation fails the job; that is an outcome,
    /// not an error. Errors are returned only when the job cannot be read
    /// or its progress cannot be persisted.
    pub async fn run(
        &self,
        job_id: JobId,
        definition: &StrategyDefinition,
        start: StartPoint,
        token: &CancellationToken,
    ) -> Result<JobOutcome, MapflowError> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| MapflowError::JobNotFound(job_id.to_string()))?;
        let mut journal = Journal::new(job_id, self.store.sequence_heads(job_id).await?);
        let (mut ctx, first_step) = match start {
            StartPoint::Fresh(ctx) => (ctx, 0),
            StartPoint::Resume { context, next_step } => (context, next_step),
        };

        match job.status {
            JobStatus::Pending => {
                job.transition_to(JobStatus::Running)?;
                journal.status_change(JobStatus::Pending, JobStatus::Running);
                journal.log(
                    LogLevel::Info,
                    None,
                    format!("Job started with strategy '{}'", job.strategy_name),
                    None,
                );
            }
            JobStatus::Running => journal.log(
                LogLevel::Info,
                None,
                format!("Job resumed at step {first_step}"),
                Some(json!({ "retry_count": job.retry_count })),
            ),
            other => return Err(MapflowError::invalid_transition(other, JobStatus::Running)),
        }
        info!(
            job_id = %job_id,
            strategy = %job.strategy_name,
            first_step,
            "Job running"
        );
        self.persist(&job, &mut journal).await?;

        let initial: BTreeSet<String> = job.initial_datasets.iter().cloned().collect();
        let plan = match validate_strategy(definition, &self.registry, &job.parameters, &initial) {
            Ok(plan) => plan,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Strategy failed to load");
                job.error = Some(JobError {
                    message: err.to_string(),
                    detail: json!({ "strategy": definition.name, "kind": err.kind() }),
                    trace: None,
                });
                journal.log(
                    LogLevel::Error,
                    None,
                    format!("Strategy '{}' failed to load: {err}", definition.name),
                    Some(json!({ "kind": err.kind() })),
                );
                journal.event(
                    JobEventKind::Error,
                    json!({ "kind": err.kind(), "message": err.to_string() }),
                );
                return self.finish(job, ctx, JobStatus::Failed, &mut journal).await;
            }
        };
        job.total_steps = plan.len();

        for index in first_step..plan.len() {
            if token.is_cancelled() {
                journal.log(
                    LogLevel::Warning,
                    None,
                    format!("Job cancelled before step {index}"),
                    Some(json!({ "reason": token.reason() })),
                );
                return self.finish(job, ctx, JobStatus::Cancelled, &mut journal).await;
            }

            match self
                .run_step(&mut job, &plan, index, &mut ctx, &mut journal, token)
                .await?
            {
                StepOutcome::Completed | StepOutcome::Skipped => {}
                StepOutcome::Failed => return Ok(JobOutcome { job, context: ctx }),
                StepOutcome::Cancelled => {
                    return self.finish(job, ctx, JobStatus::Cancelled, &mut journal).await;
                }
            }
        }

        let results = self.store.list_results(job_id).await?;
        job.results = Some(json!({
            "datasets": ctx.keys().collect::<Vec<_>>(),
            "results": results
                .iter()
                .map(|r| json!({ "step_index": r.step_index, "key": r.result_key }))
                .collect::<Vec<_>>(),
            "output_files": ctx
                .output_files()
                .iter()
                .map(|f| json!({ "dataset_key": f.dataset_key, "path": f.path, "format": f.format }))
                .collect::<Vec<_>>(),
        }));
        self.finish(job, ctx, JobStatus::Completed, &mut journal).await
    }

    async fn run_step(
        &self,
        job: &mut Job,
        plan: &StrategyPlan,
        index: usize,
        ctx: &mut ExecutionContext,
        journal: &mut Journal,
        token: &CancellationToken,
    ) -> Result<StepOutcome, MapflowError> {
        let planned = &plan.steps[index];
        let definition = &planned.definition;
        let name = definition.name.as_str();
        let action_type = definition.action_type.as_str();

        let mut step = self.prepare_step(job.id, planned).await?;
        step.transition_to(StepStatus::Running)?;
        info!(job_id = %job.id, step = name, action_type, step_index = index, "Step started");
        journal.log(LogLevel::Info, Some(index), format!("Step '{name}' started"), None);

        if self.checkpoints.policy().before_step {
            match self
                .checkpoints
                .checkpoint(job.id, index, CheckpointKind::PreStep, ctx)
                .await
            {
                Ok(checkpoint) => record_checkpoint(job, journal, &checkpoint),
                Err(e) => checkpoint_failed(job.id, journal, index, &e),
            }
        }
        self.store.upsert_step(&step).await?;

        let max_retries = definition.max_retries.unwrap_or(job.max_retries);
        let snapshot = ctx.clone();
        let mut retry = RetryState::new();
        let started = Instant::now();

        let outcome = loop {
            let attempt = retry.retries + 1;
            debug!(job_id = %job.id, step = name, action_type, attempt, "Executing step");
            match self.attempt(&plan.parameters, planned, ctx, &mut step).await {
                Ok(result) => break Ok(result),
                Err(err) => match should_retry(&mut retry, &self.retry, err.is_retryable(), max_retries) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            job_id = %job.id,
                            step = name,
                            action_type,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "Retrying step"
                        );
                        journal.log(
                            LogLevel::Warning,
                            Some(index),
                            format!("Attempt {attempt} of step '{name}' failed, retrying: {err}"),
                            Some(json!({ "kind": err.kind(), "attempt": attempt })),
                        );
                        record_error(&mut step, &err);
                        step.retry_count += 1;
                        *ctx = snapshot.clone();
                        if let Err(cancelled) = backoff(delay, token).await {
                            break Err(cancelled);
                        }
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => break Err(err),
                },
            }
        };
        step.duration_ms = Some(elapsed_ms(started));

        match outcome {
            Ok(result) => {
                step.transition_to(StepStatus::Completed)?;
                step.error = None;
                step.error_kind = None;
                step.can_retry = false;
                step.output_summary = Some(result.summary());
                job.resource_usage.records_processed += result.metrics.records_processed;
                let results = result
                    .artifacts
                    .iter()
                    .map(|artifact| {
                        Ok(ResultStorage::inline_json(
                            job.id,
                            index,
                            &artifact.key,
                            &artifact.content_type,
                            serde_json::to_vec(&artifact.payload)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, MapflowError>>()?;
                step.metrics = result.metrics;
                job.set_progress(index + 1);

                info!(
                    job_id = %job.id,
                    step = name,
                    action_type,
                    attempt = step.retry_count + 1,
                    duration_ms = step.duration_ms,
                    "Step completed"
                );
                journal.log(
                    LogLevel::Info,
                    Some(index),
                    format!("Step '{name}' completed: {}", result.message),
                    Some(json!({ "metrics": step.metrics })),
                );
                journal.event(JobEventKind::Progress, progress_payload(job, &step));
                let checkpoint = self
                    .build_checkpoint(job, journal, index + 1, CheckpointKind::PostStep, ctx)
                    .await;
                self.commit(job, step, checkpoint, results, journal).await?;
                Ok(StepOutcome::Completed)
            }
            Err(MapflowError::Cancelled(reason)) => {
                *ctx = snapshot;
                step.transition_to(StepStatus::Failed)?;
                step.error = Some(format!("cancelled during retry backoff: {reason}"));
                step.error_kind = Some("cancelled".to_string());
                step.can_retry = true;
                warn!(job_id = %job.id, step = name, action_type, "Step interrupted by cancellation");
                journal.log(
                    LogLevel::Warning,
                    Some(index),
                    format!("Step '{name}' interrupted by cancellation"),
                    Some(json!({ "reason": reason })),
                );
                self.commit(job, step, None, Vec::new(), journal).await?;
                Ok(StepOutcome::Cancelled)
            }
            Err(err) if !definition.is_required => {
                *ctx = snapshot;
                record_error(&mut step, &err);
                step.transition_to(StepStatus::Skipped)?;
                job.set_progress(index + 1);

                warn!(
                    job_id = %job.id,
                    step = name,
                    action_type,
                    attempt = step.retry_count + 1,
                    error = %err,
                    "Optional step failed, skipping"
                );
                let detail = error_detail(&step, &err);
                journal.log(
                    LogLevel::Warning,
                    Some(index),
                    format!("Optional step '{name}' skipped: {err}"),
                    Some(detail.clone()),
                );
                journal.event(JobEventKind::Error, with_message(detail, &err));
                journal.event(JobEventKind::Progress, progress_payload(job, &step));
                let checkpoint = self
                    .build_checkpoint(job, journal, index + 1, CheckpointKind::PostStep, ctx)
                    .await;
                self.commit(job, step, checkpoint, Vec::new(), journal).await?;
                Ok(StepOutcome::Skipped)
            }
            Err(err) => {
                *ctx = snapshot;
                record_error(&mut step, &err);
                step.transition_to(StepStatus::Failed)?;

                error!(
                    job_id = %job.id,
                    step = name,
                    action_type,
                    attempt = step.retry_count + 1,
                    error = %err,
                    "Required step failed"
                );
                let detail = error_detail(&step, &err);
                job.error = Some(JobError {
                    message: format!("Step '{name}' failed: {err}"),
                    detail: detail.clone(),
                    trace: None,
                });
                journal.log(
                    LogLevel::Error,
                    Some(index),
                    format!("Step '{name}' failed: {err}"),
                    Some(detail.clone()),
                );
                journal.event(JobEventKind::Error, with_message(detail, &err));
                let checkpoint = self
                    .build_checkpoint(job, journal, index, CheckpointKind::OnError, ctx)
                    .await;

                let from = job.status;
                job.transition_to(JobStatus::Failed)?;
                journal.status_change(from, JobStatus::Failed);
                journal.event(JobEventKind::Complete, json!({ "status": JobStatus::Failed }));
                self.commit(job, step, checkpoint, Vec::new(), journal).await?;
                Ok(StepOutcome::Failed)
            }
        }
    }

    /// One attempt: resolve templates, validate, execute in a scoped view.
    async fn attempt(
        &self,
        parameters: &BTreeMap<String, serde_json::Value>,
        planned: &PlannedStep,
        ctx: &mut ExecutionContext,
        step: &mut ExecutionStep,
    ) -> Result<ActionResult, MapflowError> {
        let definition = &planned.definition;
        let name = definition.name.as_str();
        if let Some(err) = &planned.param_error {
            return Err(err.clone().into());
        }

        let resolved = TemplateResolver::new(parameters, ctx)
            .resolve_params(&definition.params)
            .map_err(|e| e.into_validation(name))?;
        let descriptor = self.registry.descriptor(&definition.action_type)?;
        let params = descriptor.params.validate(name, &resolved)?;
        step.params = params.to_json();
        let access = descriptor.capabilities.resolve(name, &params)?;
        let action = self.registry.resolve(&definition.action_type)?;

        let mut scoped = ScopedContext::new(ctx, &access);
        let result = action.execute(&params, &mut scoped).await;
        if let Some(violation) = scoped.take_violation() {
            return Err(violation);
        }
        let result = result?;
        if !result.success {
            return Err(ActionError::permanent(result.message).into());
        }
        Ok(result)
    }

    /// Loads the step row, reopening it when a resume re-runs the step.
    async fn prepare_step(&self, job_id: JobId, planned: &PlannedStep) -> Result<ExecutionStep, MapflowError> {
        let definition = &planned.definition;
        let fresh = ExecutionStep::new(job_id, planned.index, &definition.name, &definition.action_type);
        let Some(mut existing) = self.store.get_step(job_id, planned.index).await? else {
            return Ok(fresh);
        };
        if existing.reopen().is_err() {
            // Completed or skipped earlier, re-run from an older checkpoint.
            existing = ExecutionStep {
                started_at: existing.started_at,
                retry_count: existing.retry_count,
                ..fresh
            };
        }
        Ok(existing)
    }

    async fn build_checkpoint(
        &self,
        job: &mut Job,
        journal: &mut Journal,
        step_index: usize,
        kind: CheckpointKind,
        ctx: &ExecutionContext,
    ) -> Option<ExecutionCheckpoint> {
        if !self.checkpoints.policy().applies_to(kind) {
            return None;
        }
        match self.checkpoints.build(job.id, step_index, kind, ctx).await {
            Ok(checkpoint) => {
                record_checkpoint(job, journal, &checkpoint);
                Some(checkpoint)
            }
            Err(e) => {
                checkpoint_failed(job.id, journal, step_index, &e);
                None
            }
        }
    }

    async fn commit(
        &self,
        job: &Job,
        step: ExecutionStep,
        checkpoint: Option<ExecutionCheckpoint>,
        results: Vec<ResultStorage>,
        journal: &mut Journal,
    ) -> Result<(), MapflowError> {
        let (logs, events) = journal.drain();
        let commit = StepCommit {
            job: job.clone(),
            step,
            logs,
            events,
            checkpoint,
            results,
        };
        self.store.commit_step(&commit).await?;
        for event in &commit.events {
            self.sink.emit(event).await;
        }
        Ok(())
    }

    async fn persist(&self, job: &Job, journal: &mut Journal) -> Result<(), MapflowError> {
        let (logs, events) = journal.drain();
        self.store.update_job(job).await?;
        if !logs.is_empty() {
            self.store.append_logs(&logs).await?;
        }
        if !events.is_empty() {
            self.store.append_events(&events).await?;
        }
        for event in &events {
            self.sink.emit(event).await;
        }
        Ok(())
    }

    async fn finish(
        &self,
        mut job: Job,
        context: ExecutionContext,
        status: JobStatus,
        journal: &mut Journal,
    ) -> Result<JobOutcome, MapflowError> {
        let from = job.status;
        job.transition_to(status)?;
        journal.status_change(from, status);
        journal.log(
            if status == JobStatus::Completed {
                LogLevel::Info
            } else {
                LogLevel::Warning
            },
            None,
            format!("Job {status}"),
            Some(json!({ "current_step_index": job.current_step_index, "total_steps": job.total_steps })),
        );
        journal.event(JobEventKind::Complete, json!({ "status": status }));
        self.persist(&job, journal).await?;
        info!(
            job_id = %job.id,
            status = %status,
            steps = job.current_step_index,
            total_steps = job.total_steps,
            "Job finished"
        );
        Ok(JobOutcome { job, context })
    }
}

fn with_message(mut detail: serde_json::Value, err: &MapflowError) -> serde_json::Value {
    if let Some(map) = detail.as_object_mut() {
        map.insert("message".to_string(), json!(err.to_string()));
    }
    detail
}

fn record_checkpoint(job: &mut Job, journal: &mut Journal, checkpoint: &ExecutionCheckpoint) {
    job.resource_usage.checkpoints_written += 1;
    job.resource_usage.bytes_checkpointed += checkpoint.size_bytes;
    debug!(
        job_id = %job.id,
        checkpoint_id = %checkpoint.id,
        step_index = checkpoint.step_index,
        kind = %checkpoint.kind,
        "Checkpoint taken"
    );
    journal.event(
        JobEventKind::Checkpoint,
        json!({
            "checkpoint_id": checkpoint.id,
            "step_index": checkpoint.step_index,
            "kind": checkpoint.kind,
            "size_bytes": checkpoint.size_bytes,
        }),
    );
}

/// A failed checkpoint is reported and the job carries on.
fn checkpoint_failed(job_id: JobId, journal: &mut Journal, step_index: usize, err: &CheckpointError) {
    warn!(job_id = %job_id, step_index, error = %err, "Checkpoint failed");
    journal.log(
        LogLevel::Warning,
        None,
        format!("Checkpoint failed: {err}"),
        Some(json!({ "step_index": step_index })),
    );
    journal.event(
        JobEventKind::Error,
        json!({ "kind": "checkpoint", "step_index": step_index, "message": err.to_string() }),
    );
}
