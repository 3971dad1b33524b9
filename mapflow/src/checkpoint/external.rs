//! Storage for checkpoint payloads too large to keep inline.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::CheckpointError;
use crate::store::CheckpointId;

/// Blob storage keyed by checkpoint id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalContextStore: Send + Sync {
    /// Stores bytes for a checkpoint and returns their location.
    async fn put(&self, checkpoint_id: CheckpointId, bytes: Vec<u8>) -> Result<String, CheckpointError>;

    /// Reads the bytes at a location.
    async fn get(&self, location: &str) -> Result<Vec<u8>, CheckpointError>;

    /// Deletes the bytes at a location. Returns false if nothing was there.
    async fn delete(&self, location: &str) -> Result<bool, CheckpointError>;
}

/// Filesystem store writing one file per checkpoint under a directory.
#[derive(Debug, Clone)]
pub struct FsContextStore {
    root: PathBuf,
}

impl FsContextStore {
    /// Creates a store rooted at `root`. The directory is created on the
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn path_of(&self, location: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !location.is_empty()
            && location
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid || location.contains("..") {
            return Err(CheckpointError::Blob(format!("invalid location '{location}'")));
        }
        Ok(self.root.join(location))
    }
}

#[async_trait]
impl ExternalContextStore for FsContextStore {
    async fn put(&self, checkpoint_id: CheckpointId, bytes: Vec<u8>) -> Result<String, CheckpointError> {
        let location = format!("{checkpoint_id}.ckpt");
        let path = self.path_of(&location)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CheckpointError::Blob(format!("create {}: {e}", self.root.display())))?;

        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| CheckpointError::Blob(format!("write {}: {e}", staging.display())))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| CheckpointError::Blob(format!("rename {}: {e}", path.display())))?;
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, CheckpointError> {
        let path = self.path_of(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| CheckpointError::Blob(format!("read {}: {e}", path.display())))
    }

    async fn delete(&self, location: &str) -> Result<bool, CheckpointError> {
        let path = self.path_of(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::Blob(format!("delete {}: {e}", path.display()))),
        }
    }
}

/// In-memory store for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryContextStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl ExternalContextStore for InMemoryContextStore {
    async fn put(&self, checkpoint_id: CheckpointId, bytes: Vec<u8>) -> Result<String, CheckpointError> {
        let location = checkpoint_id.to_string();
        self.blobs.lock().insert(location.clone(), bytes);
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, CheckpointError> {
        self.blobs
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| CheckpointError::Blob(format!("no blob at '{location}'")))
    }

    async fn delete(&self, location: &str) -> Result<bool, CheckpointError> {
        Ok(self.blobs.lock().remove(location).is_some())
    }
}
