use async_trait::async_trait;

use strata_core::error::Result;

use crate::types::Checkpoint;

/// Async storage backend for graph checkpoints.
///
/// Checkpoints of one thread form a parent-linked chain. Backends keep them
/// in save order so that "latest" means "most recently saved", which is the
/// head of the newest fork after time travel.
///
/// Implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a checkpoint. Saving an existing ID replaces it in place.
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Load a checkpoint by ID, or the latest one of the thread when `checkpoint_id` is `None`.
    ///
    /// Returns `Ok(None)` when nothing matches.
    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a thread, oldest first.
    async fn list_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Delete all checkpoints for a given thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
