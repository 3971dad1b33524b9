//! The job interface: submit, query, cancel, stream and resume.

use dashmap::DashMap;
use futures::stream::{self, Stream};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::actions::ActionRegistry;
use crate::cancellation::CancellationToken;
use crate::checkpoint::{
    CheckpointManager, ExternalContextStore, FsContextStore, InMemoryContextStore,
};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::core::{JobEventKind, JobStatus};
use crate::errors::{CheckpointError, MapflowError};
use crate::events::{BroadcastEventSink, EventSink, FanoutEventSink};
use crate::interpreter::{JobRunner, RetryConfig, StartPoint};
use crate::observability::log_job_summary;
use crate::store::{InMemoryJobStore, Job, JobEvent, JobId, JobStore, SqliteJobStore};
use crate::strategy::{StrategyCatalog, StrategyDefinition};

/// Runs jobs on the tokio runtime, at most `max_concurrent_jobs` at once.
///
/// Status queries always read the store, so they reflect what has been
/// committed rather than what a running job holds in memory.
pub struct JobService {
    catalog: Arc<StrategyCatalog>,
    store: Arc<dyn JobStore>,
    checkpoints: CheckpointManager,
    runner: JobRunner,
    broadcast: Arc<BroadcastEventSink>,
    permits: Arc<Semaphore>,
    tokens: Arc<DashMap<JobId, Arc<CancellationToken>>>,
    handles: DashMap<JobId, JoinHandle<()>>,
    default_max_retries: u32,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("catalog", &self.catalog)
            .field("runner", &self.runner)
            .field("available_permits", &self.permits.available_permits())
            .field("active_jobs", &self.tokens.len())
            .field("default_max_retries", &self.default_max_retries)
            .finish_non_exhaustive()
    }
}

impl JobService {
    /// Creates a service running one job at a time with no retry budget.
    #[must_use]
    pub fn new(
        registry: Arc<ActionRegistry>,
        catalog: Arc<StrategyCatalog>,
        store: Arc<dyn JobStore>,
        checkpoints: CheckpointManager,
    ) -> Self {
        let broadcast = Arc::new(BroadcastEventSink::default());
        let runner = JobRunner::new(registry, store.clone(), checkpoints.clone())
            .with_sink(broadcast.clone());
        Self {
            catalog,
            store,
            checkpoints,
            runner,
            broadcast,
            permits: Arc::new(Semaphore::new(1)),
            tokens: Arc::new(DashMap::new()),
            handles: DashMap::new(),
            default_max_retries: 0,
        }
    }

    /// Builds a service from configuration.
    ///
    /// Opens the SQLite store at `database_path` and the checkpoint
    /// directory at `checkpoint_dir`, falling back to memory for either.
    pub fn from_config(
        config: &EngineConfig,
        registry: Arc<ActionRegistry>,
        catalog: Arc<StrategyCatalog>,
    ) -> Result<Self, MapflowError> {
        config.validate()?;
        let store: Arc<dyn JobStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteJobStore::open(path)?),
            None => Arc::new(InMemoryJobStore::new()),
        };
        let external: Arc<dyn ExternalContextStore> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(FsContextStore::new(dir.clone())),
            None => Arc::new(InMemoryContextStore::new()),
        };
        let checkpoints = CheckpointManager::new(store.clone(), external, config.checkpoint.clone());
        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            database = ?config.database_path,
            checkpoint_dir = ?config.checkpoint_dir,
            "Job service configured"
        );
        Ok(Self::new(registry, catalog, store, checkpoints)
            .with_max_concurrent_jobs(config.max_concurrent_jobs)
            .with_default_max_retries(config.default_max_retries)
            .with_retry_config(config.retry.clone()))
    }

    /// Sets the size of the worker pool.
    #[must_use]
    pub fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max_concurrent_jobs.max(1)));
        self
    }

    /// Sets the job-level retry budget of submitted jobs.
    #[must_use]
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Sets the delay between step attempts.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.runner = self.runner.with_retry_config(retry);
        self
    }

    /// Forwards committed events to `sink` as well as to event streams.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        let fanout = FanoutEventSink::new()
            .with_sink(self.broadcast.clone())
            .with_sink(sink);
        self.runner = self.runner.with_sink(Arc::new(fanout));
        self
    }

    /// The store behind this service.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The checkpoint manager behind this service.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Number of jobs currently queued or running in this process.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.tokens.len()
    }

    /// Creates a job for a registered strategy and queues it.
    ///
    /// Submitted parameters override the strategy's defaults.
    pub async fn submit(
        &self,
        strategy_name: &str,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobId, MapflowError> {
        self.submit_with_context(strategy_name, parameters, ExecutionContext::new())
            .await
    }

    /// Like [`JobService::submit`], starting from a context that already
    /// holds datasets.
    pub async fn submit_with_context(
        &self,
        strategy_name: &str,
        parameters: BTreeMap<String, serde_json::Value>,
        context: ExecutionContext,
    ) -> Result<JobId, MapflowError> {
        let definition = self.catalog.get(strategy_name)?;
        let job = Job::new(
            definition.name.clone(),
            definition.version.clone(),
            definition.steps.len(),
            definition.merge_parameters(&parameters),
        )
        .with_max_retries(self.default_max_retries)
        .with_initial_datasets(context.keys().map(str::to_string));
        self.store.create_job(&job).await?;

        info!(
            job_id = %job.id,
            strategy = %definition.name,
            total_steps = job.total_steps,
            "Job submitted"
        );
        self.spawn(job.id, definition, StartPoint::Fresh(context));
        Ok(job.id)
    }

    /// Reads the persisted state of a job.
    pub async fn get_status(&self, job_id: JobId) -> Result<Job, MapflowError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| MapflowError::JobNotFound(job_id.to_string()))
    }

    /// Lists persisted jobs, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, MapflowError> {
        Ok(self.store.list_jobs(status).await?)
    }

    /// Requests cancellation of a queued or running job.
    ///
    /// The job stops before its next step. Returns `false` if the job is
    /// not active in this service.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.tokens.get(&job_id) {
            Some(token) => {
                token.cancel("cancelled by request");
                info!(job_id = %job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Re-runs an interrupted, failed or cancelled job from its latest
    /// checkpoint, keeping its step history.
    ///
    /// Failed and cancelled jobs spend one unit of their retry budget. A
    /// job that never got past its first step and has no checkpoint starts
    /// over from an empty context.
    pub async fn resume(&self, job_id: JobId) -> Result<(), MapflowError> {
        if self.tokens.contains_key(&job_id) {
            return Err(MapflowError::invalid_transition(JobStatus::Running, JobStatus::Running));
        }
        let mut job = self.get_status(job_id).await?;
        if job.status == JobStatus::Completed {
            return Err(MapflowError::invalid_transition(job.status, JobStatus::Running));
        }
        let definition = self.catalog.get(&job.strategy_name)?;

        let start = match self.checkpoints.resume(job_id).await {
            Ok((context, next_step)) => StartPoint::Resume { context, next_step },
            Err(MapflowError::Checkpoint(CheckpointError::NotResumable(reason)))
                if job.current_step_index == 0 && job.initial_datasets.is_empty() =>
            {
                warn!(job_id = %job_id, reason = %reason, "No checkpoint, restarting from the first step");
                StartPoint::Resume {
                    context: ExecutionContext::new(),
                    next_step: 0,
                }
            }
            Err(e) => return Err(e),
        };

        if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            job.reopen()?;
            self.store.update_job(&job).await?;
        }
        info!(
            job_id = %job_id,
            status = %job.status,
            retry_count = job.retry_count,
            "Job resumed"
        );
        self.spawn(job_id, definition, start);
        Ok(())
    }

    /// Waits for a job's task to end and returns its persisted state.
    pub async fn wait(&self, job_id: JobId) -> Result<Job, MapflowError> {
        if let Some((_, handle)) = self.handles.remove(&job_id) {
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "Job task aborted");
            }
        }
        self.get_status(job_id).await
    }

    /// Streams a job's events in sequence order.
    ///
    /// Replays the committed history, then follows live events until the
    /// job's run ends. For a job that is not active the stream ends after
    /// the history.
    pub async fn stream_events(
        &self,
        job_id: JobId,
    ) -> Result<impl Stream<Item = JobEvent> + Send + 'static, MapflowError> {
        self.get_status(job_id).await?;
        // Subscribe before the history read so nothing committed in between is missed.
        let mut receiver = None;
        if self.tokens.contains_key(&job_id) {
            receiver = Some(self.broadcast.subscribe(job_id));
            if !self.tokens.contains_key(&job_id) {
                // Finished in between; its task may have closed the channel already.
                receiver = None;
                self.broadcast.close(job_id);
            }
        }
        let history = self.store.list_events(job_id, 0).await?;

        let cursor = EventCursor::new(job_id, self.store.clone(), receiver, history);
        Ok(stream::unfold(cursor, |mut cursor| async move {
            cursor.next().await.map(|event| (event, cursor))
        }))
    }

    fn spawn(&self, job_id: JobId, definition: Arc<StrategyDefinition>, start: StartPoint) {
        let token = Arc::new(CancellationToken::new());
        self.tokens.insert(job_id, token.clone());

        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let tokens = self.tokens.clone();
        let broadcast = self.broadcast.clone();
        let store = self.store.clone();
        let handle = tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => match runner.run(job_id, &definition, start, &token).await {
                    Ok(outcome) => match store.list_steps(job_id).await {
                        Ok(steps) => log_job_summary(&outcome.job, &steps),
                        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to read steps for summary"),
                    },
                    Err(e) => error!(job_id = %job_id, error = %e, "Job task failed"),
                },
                Err(e) => error!(job_id = %job_id, error = %e, "Worker pool closed"),
            }
            tokens.remove(&job_id);
            broadcast.close(job_id);
        });

        self.handles.retain(|_, h| !h.is_finished());
        self.handles.insert(job_id, handle);
    }
}

/// Merges the stored history of a job with its live broadcast.
struct EventCursor {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    receiver: Option<broadcast::Receiver<JobEvent>>,
    backlog: VecDeque<JobEvent>,
    next_sequence: u64,
    live_from: u64,
    finished: bool,
}

impl EventCursor {
    fn new(
        job_id: JobId,
        store: Arc<dyn JobStore>,
        receiver: Option<broadcast::Receiver<JobEvent>>,
        history: Vec<JobEvent>,
    ) -> Self {
        let live_from = history.last().map_or(0, |e| e.sequence + 1);
        let finished = receiver.is_none();
        Self {
            job_id,
            store,
            receiver,
            backlog: history.into(),
            next_sequence: 0,
            live_from,
            finished,
        }
    }

    async fn next(&mut self) -> Option<JobEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.sequence < self.next_sequence {
                    continue;
                }
                self.next_sequence = event.sequence + 1;
                if event.kind == JobEventKind::Complete && event.sequence >= self.live_from {
                    self.finished = true;
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => {
                    if event.sequence >= self.next_sequence {
                        self.backlog.push_back(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "Event stream lagged, reading from the store");
                    match self.store.list_events(self.job_id, self.next_sequence).await {
                        Ok(events) => self.backlog.extend(events),
                        Err(e) => {
                            error!(job_id = %self.job_id, error = %e, "Failed to read missed events");
                            return None;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
