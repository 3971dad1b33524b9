//! Checkpoints of the execution context for resumable jobs.
//!
//! Small snapshots are stored inline in the checkpoint row; larger ones
//! are optionally zstd-compressed and written to an
//! [`ExternalContextStore`], with the row holding a pointer.

mod external;
mod manager;
mod policy;

#[cfg(test)]
pub use external::MockExternalContextStore;
pub use external::{ExternalContextStore, FsContextStore, InMemoryContextStore};
pub use manager::CheckpointManager;
pub use policy::CheckpointPolicy;
