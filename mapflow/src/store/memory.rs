//! In-memory [`JobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::{
    CheckpointId, ExecutionCheckpoint, ExecutionLog, ExecutionStep, Job, JobEvent, JobId, JobStore,
    ResultStorage, SequenceHeads, StepCommit, StoreError, StoreResult,
};
use crate::core::JobStatus;

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    steps: BTreeMap<(JobId, usize), ExecutionStep>,
    logs: HashMap<JobId, Vec<ExecutionLog>>,
    checkpoints: Vec<ExecutionCheckpoint>,
    results: BTreeMap<(JobId, usize, String), ResultStorage>,
    events: Vec<JobEvent>,
}

impl Tables {
    fn update_job(&mut self, job: &Job) -> StoreResult<()> {
        match self.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", job.id))),
        }
    }

    fn upsert_step(&mut self, step: &ExecutionStep) {
        self.steps
            .insert((step.job_id, step.step_index), step.clone());
    }

    fn append_logs(&mut self, logs: &[ExecutionLog]) {
        for log in logs {
            self.logs.entry(log.job_id).or_default().push(log.clone());
        }
    }

    fn save_result(&mut self, result: &ResultStorage) {
        self.results.insert(
            (result.job_id, result.step_index, result.result_key.clone()),
            result.clone(),
        );
    }
}

/// A [`JobStore`] keeping every table in process memory.
///
/// All tables sit behind one lock, so `commit_step` is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        self.tables.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        self.tables.lock().update_job(job)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.tables.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> StoreResult<Vec<Job>> {
        let tables = self.tables.lock();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn upsert_step(&self, step: &ExecutionStep) -> StoreResult<()> {
        self.tables.lock().upsert_step(step);
        Ok(())
    }

    async fn get_step(&self, job_id: JobId, step_index: usize) -> StoreResult<Option<ExecutionStep>> {
        Ok(self.tables.lock().steps.get(&(job_id, step_index)).cloned())
    }

    async fn list_steps(&self, job_id: JobId) -> StoreResult<Vec<ExecutionStep>> {
        let tables = self.tables.lock();
        Ok(tables
            .steps
            .range((job_id, 0)..=(job_id, usize::MAX))
            .map(|(_, step)| step.clone())
            .collect())
    }

    async fn append_logs(&self, logs: &[ExecutionLog]) -> StoreResult<()> {
        self.tables.lock().append_logs(logs);
        Ok(())
    }

    async fn list_logs(&self, job_id: JobId) -> StoreResult<Vec<ExecutionLog>> {
        let mut logs = self
            .tables
            .lock()
            .logs
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        logs.sort_by_key(|log| log.sequence);
        Ok(logs)
    }

    async fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> StoreResult<()> {
        self.tables.lock().checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, job_id: JobId) -> StoreResult<Vec<ExecutionCheckpoint>> {
        Ok(self
            .tables
            .lock()
            .checkpoints
            .iter()
            .filter(|cp| cp.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_expired_checkpoints(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ExecutionCheckpoint>> {
        Ok(self
            .tables
            .lock()
            .checkpoints
            .iter()
            .filter(|cp| cp.expires_at.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn delete_checkpoint(&self, checkpoint_id: CheckpointId) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let before = tables.checkpoints.len();
        tables.checkpoints.retain(|cp| cp.id != checkpoint_id);
        Ok(tables.checkpoints.len() != before)
    }

    async fn save_result(&self, result: &ResultStorage) -> StoreResult<()> {
        self.tables.lock().save_result(result);
        Ok(())
    }

    async fn read_result(
        &self,
        job_id: JobId,
        step_index: usize,
        result_key: &str,
    ) -> StoreResult<Option<ResultStorage>> {
        let mut tables = self.tables.lock();
        Ok(tables
            .results
            .get_mut(&(job_id, step_index, result_key.to_string()))
            .map(|result| {
                result.access_count += 1;
                result.last_accessed_at = Some(Utc::now());
                result.clone()
            }))
    }

    async fn list_results(&self, job_id: JobId) -> StoreResult<Vec<ResultStorage>> {
        Ok(self
            .tables
            .lock()
            .results
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn append_events(&self, events: &[JobEvent]) -> StoreResult<()> {
        self.tables.lock().events.extend_from_slice(events);
        Ok(())
    }

    async fn list_events(&self, job_id: JobId, from_sequence: u64) -> StoreResult<Vec<JobEvent>> {
        let mut events: Vec<JobEvent> = self
            .tables
            .lock()
            .events
            .iter()
            .filter(|e| e.job_id == job_id && e.sequence >= from_sequence)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn pending_events(&self, limit: usize) -> StoreResult<Vec<JobEvent>> {
        let mut events: Vec<JobEvent> = self
            .tables
            .lock()
            .events
            .iter()
            .filter(|e| !e.delivered)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.sequence));
        events.truncate(limit);
        Ok(events)
    }

    async fn mark_event_delivered(&self, event_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        Ok(tables
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .map(|event| {
                event.delivered = true;
                event.attempts += 1;
                event.last_error = None;
            })
            .is_some())
    }

    async fn record_delivery_failure(&self, event_id: Uuid, error: &str) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        Ok(tables
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .map(|event| {
                event.attempts += 1;
                event.last_error = Some(error.to_string());
            })
            .is_some())
    }

    async fn commit_step(&self, commit: &StepCommit) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        // Check first so a missing job leaves every table untouched.
        if !tables.jobs.contains_key(&commit.job.id) {
            return Err(StoreError::NotFound(format!("job {}", commit.job.id)));
        }
        tables.update_job(&commit.job)?;
        tables.upsert_step(&commit.step);
        tables.append_logs(&commit.logs);
        tables.events.extend_from_slice(&commit.events);
        if let Some(checkpoint) = &commit.checkpoint {
            tables.checkpoints.push(checkpoint.clone());
        }
        for result in &commit.results {
            tables.save_result(result);
        }
        Ok(())
    }

    async fn sequence_heads(&self, job_id: JobId) -> StoreResult<SequenceHeads> {
        let tables = self.tables.lock();
        let next_log = tables
            .logs
            .get(&job_id)
            .and_then(|logs| logs.iter().map(|l| l.sequence).max())
            .map_or(0, |max| max + 1);
        let next_event = tables
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.sequence)
            .max()
            .map_or(0, |max| max + 1);
        Ok(SequenceHeads {
            next_log,
            next_event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CheckpointKind, JobEventKind, LogLevel, StepStatus};
    use crate::store::Payload;
    use pretty_assertions::assert_eq;

    fn job() -> Job {
        Job::new("s", "1.0", 2, BTreeMap::new())
    }

    fn log(job_id: JobId, sequence: u64) -> ExecutionLog {
        ExecutionLog {
            job_id,
            sequence,
            level: LogLevel::Info,
            message: format!("line {sequence}"),
            detail: None,
            step_index: None,
            category: "step".into(),
            component: "test".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_job_crud() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        store.create_job(&job).await.unwrap();

        job.transition_to(JobStatus::Running).unwrap();
        store.update_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(store.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let store = InMemoryJobStore::new();
        let err = store.update_job(&job()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_steps_upsert_and_order() {
        let store = InMemoryJobStore::new();
        let job = job();
        let other = JobId::new();

        let mut step1 = ExecutionStep::new(job.id, 1, "b", "x");
        store.upsert_step(&step1).await.unwrap();
        store.upsert_step(&ExecutionStep::new(job.id, 0, "a", "x")).await.unwrap();
        store.upsert_step(&ExecutionStep::new(other, 0, "z", "x")).await.unwrap();

        step1.status = StepStatus::Running;
        store.upsert_step(&step1).await.unwrap();

        let steps = store.list_steps(job.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_name, "a");
        assert_eq!(steps[1].status, StepStatus::Running);
    }

    #[tokio::test]
    async fn test_commit_step_writes_everything() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();

        let commit = StepCommit {
            job: job.clone(),
            step: ExecutionStep::new(job.id, 0, "a", "x"),
            logs: vec![log(job.id, 0), log(job.id, 1)],
            events: vec![JobEvent::new(job.id, 0, JobEventKind::Progress, serde_json::json!({}))],
            checkpoint: Some(ExecutionCheckpoint {
                id: CheckpointId::new(),
                job_id: job.id,
                step_index: 1,
                kind: CheckpointKind::PostStep,
                created_at: Utc::now(),
                expires_at: None,
                payload: Payload::Inline { bytes: vec![1] },
                size_bytes: 1,
                is_resumable: true,
            }),
            results: vec![ResultStorage::inline_json(job.id, 0, "r", "application/json", b"1".to_vec())],
        };
        store.commit_step(&commit).await.unwrap();

        assert_eq!(store.list_steps(job.id).await.unwrap().len(), 1);
        assert_eq!(store.list_logs(job.id).await.unwrap().len(), 2);
        assert_eq!(store.list_events(job.id, 0).await.unwrap().len(), 1);
        assert_eq!(store.list_checkpoints(job.id).await.unwrap().len(), 1);
        assert_eq!(store.list_results(job.id).await.unwrap().len(), 1);

        let heads = store.sequence_heads(job.id).await.unwrap();
        assert_eq!(heads, SequenceHeads { next_log: 2, next_event: 1 });
    }

    #[tokio::test]
    async fn test_commit_for_missing_job_writes_nothing() {
        let store = InMemoryJobStore::new();
        let job = job();
        let commit = StepCommit {
            job: job.clone(),
            step: ExecutionStep::new(job.id, 0, "a", "x"),
            logs: vec![log(job.id, 0)],
            events: Vec::new(),
            checkpoint: None,
            results: Vec::new(),
        };
        assert!(store.commit_step(&commit).await.is_err());
        assert!(store.list_logs(job.id).await.unwrap().is_empty());
        assert!(store.list_steps(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_result_bumps_access() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        store
            .save_result(&ResultStorage::inline_json(id, 2, "out", "application/json", b"[]".to_vec()))
            .await
            .unwrap();

        store.read_result(id, 2, "out").await.unwrap().unwrap();
        let second = store.read_result(id, 2, "out").await.unwrap().unwrap();
        assert_eq!(second.access_count, 2);
        assert!(second.last_accessed_at.is_some());
        assert!(store.read_result(id, 2, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_delivery_bookkeeping() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        let first = JobEvent::new(id, 0, JobEventKind::StatusChange, serde_json::json!({}));
        let second = JobEvent::new(id, 1, JobEventKind::Complete, serde_json::json!({}));
        store.append_events(&[first.clone(), second.clone()]).await.unwrap();

        assert!(store.record_delivery_failure(first.id, "timeout").await.unwrap());
        assert!(store.mark_event_delivered(second.id).await.unwrap());

        let pending = store.pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
        assert!(!store.mark_event_delivered(Uuid::new_v4()).await.unwrap());
    }
}
