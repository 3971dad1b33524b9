//! Taking, loading and pruning execution context snapshots.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CheckpointPolicy, ExternalContextStore};
use crate::compression;
use crate::context::ExecutionContext;
use crate::core::{CheckpointKind, JobStatus};
use crate::errors::{CheckpointError, MapflowError};
use crate::store::{CheckpointId, ExecutionCheckpoint, JobId, JobStore, Payload};

/// Serializes contexts into checkpoints and restores them.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn JobStore>,
    external: Arc<dyn ExternalContextStore>,
    policy: CheckpointPolicy,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Picks the checkpoint a resume starts from: the most recent resumable
/// one whose next step does not lie beyond `completed_steps`.
fn latest_resumable(
    checkpoints: &[ExecutionCheckpoint],
    completed_steps: usize,
) -> Option<&ExecutionCheckpoint> {
    checkpoints
        .iter()
        .filter(|cp| cp.is_resumable && cp.step_index <= completed_steps)
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.step_index.cmp(&b.step_index))
        })
}

impl CheckpointManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        external: Arc<dyn ExternalContextStore>,
        policy: CheckpointPolicy,
    ) -> Self {
        Self {
            store,
            external,
            policy,
        }
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Serializes `ctx` into a checkpoint without persisting the row.
    ///
    /// Large payloads are written to the external store right away; the
    /// row itself is meant to be persisted with the step's commit.
    pub async fn build(
        &self,
        job_id: JobId,
        step_index: usize,
        kind: CheckpointKind,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionCheckpoint, CheckpointError> {
        let bytes = ctx
            .to_bytes()
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let size_bytes = bytes.len() as u64;
        let id = CheckpointId::new();

        let payload = if bytes.len() > self.policy.inline_threshold_bytes {
            let (stored, compressed) = if self.policy.compress_external {
                let (compressed_bytes, metrics) = compression::compress(&bytes)?;
                debug!(
                    job_id = %job_id,
                    original = metrics.original_bytes,
                    compressed = metrics.compressed_bytes,
                    "Compressed checkpoint payload"
                );
                (compressed_bytes, true)
            } else {
                (bytes, false)
            };
            let stored_size = stored.len() as u64;
            let location = self.external.put(id, stored).await?;
            Payload::External {
                location,
                size_bytes: stored_size,
                compressed,
            }
        } else {
            Payload::Inline { bytes }
        };

        let created_at = Utc::now();
        Ok(ExecutionCheckpoint {
            id,
            job_id,
            step_index,
            kind,
            created_at,
            expires_at: self.policy.expiry_from(created_at),
            payload,
            size_bytes,
            is_resumable: true,
        })
    }

    /// Serializes `ctx` and persists the checkpoint row.
    pub async fn checkpoint(
        &self,
        job_id: JobId,
        step_index: usize,
        kind: CheckpointKind,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionCheckpoint, CheckpointError> {
        let checkpoint = self.build(job_id, step_index, kind, ctx).await?;
        self.store.save_checkpoint(&checkpoint).await?;
        debug!(
            job_id = %job_id,
            step_index,
            kind = %kind,
            size_bytes = checkpoint.size_bytes,
            "Checkpoint written"
        );
        Ok(checkpoint)
    }

    /// Restores the context held by a checkpoint.
    pub async fn load(&self, checkpoint: &ExecutionCheckpoint) -> Result<ExecutionContext, CheckpointError> {
        let bytes = match &checkpoint.payload {
            Payload::Inline { bytes } => bytes.clone(),
            Payload::External {
                location,
                compressed,
                ..
            } => {
                let stored = self.external.get(location).await?;
                if *compressed {
                    compression::decompress(&stored)?
                } else {
                    stored
                }
            }
        };
        ExecutionContext::from_bytes(&bytes).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    /// Loads the context to resume a job from and the index of the first
    /// step to run.
    ///
    /// Uses the most recent resumable checkpoint at or before the job's
    /// completed prefix. Reads only, so calling it twice gives the same
    /// answer.
    ///
    /// # Errors
    ///
    /// `JobNotFound` if the job does not exist, `Checkpoint` with
    /// `NotResumable` if it has no usable checkpoint.
    pub async fn resume(&self, job_id: JobId) -> Result<(ExecutionContext, usize), MapflowError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| MapflowError::JobNotFound(job_id.to_string()))?;
        let checkpoints = self.store.list_checkpoints(job_id).await?;

        let checkpoint = latest_resumable(&checkpoints, job.current_step_index).ok_or_else(|| {
            CheckpointError::NotResumable(format!(
                "job {job_id} has no resumable checkpoint at or before step {}",
                job.current_step_index
            ))
        })?;
        let ctx = self.load(checkpoint).await?;
        info!(
            job_id = %job_id,
            checkpoint_id = %checkpoint.id,
            step_index = checkpoint.step_index,
            "Resuming from checkpoint"
        );
        Ok((ctx, checkpoint.step_index))
    }

    /// Deletes checkpoints expired at `now`, keeping the most recent
    /// resumable checkpoint of every job that has not completed.
    ///
    /// Returns the number of checkpoints deleted.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, MapflowError> {
        let expired = self.store.list_expired_checkpoints(now).await?;
        let mut protected: HashMap<JobId, Option<CheckpointId>> = HashMap::new();
        let mut deleted = 0;

        for checkpoint in expired {
            if !protected.contains_key(&checkpoint.job_id) {
                let keep = self.protected_checkpoint(checkpoint.job_id).await?;
                protected.insert(checkpoint.job_id, keep);
            }
            if protected.get(&checkpoint.job_id).copied().flatten() == Some(checkpoint.id) {
                debug!(
                    job_id = %checkpoint.job_id,
                    checkpoint_id = %checkpoint.id,
                    "Keeping expired checkpoint of incomplete job"
                );
                continue;
            }

            if let Some(location) = checkpoint.payload.location() {
                if let Err(e) = self.external.delete(location).await {
                    warn!(checkpoint_id = %checkpoint.id, error = %e, "Failed to delete checkpoint blob");
                    continue;
                }
            }
            if self.store.delete_checkpoint(checkpoint.id).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, "Pruned expired checkpoints");
        }
        Ok(deleted)
    }

    async fn protected_checkpoint(&self, job_id: JobId) -> Result<Option<CheckpointId>, MapflowError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };
        if job.status == JobStatus::Completed {
            return Ok(None);
        }
        let checkpoints = self.store.list_checkpoints(job_id).await?;
        Ok(latest_resumable(&checkpoints, job.current_step_index).map(|cp| cp.id))
    }
}
