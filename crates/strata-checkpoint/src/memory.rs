use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use strata_core::error::{GraphError, Result};

use crate::checkpointer::Checkpointer;
use crate::types::Checkpoint;

type ThreadMap = HashMap<String, Vec<Checkpoint>>;

/// In-memory checkpointer for testing and short-lived workflows.
///
/// Thread-safe via `RwLock`. All data is lost when the checkpointer is dropped.
pub struct MemoryCheckpointer {
    /// Map: thread_id → Vec<Checkpoint> (save order)
    data: RwLock<ThreadMap>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ThreadMap>> {
        self.data
            .read()
            .map_err(|_| GraphError::Checkpoint("checkpoint lock poisoned".into()).into())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ThreadMap>> {
        self.data
            .write()
            .map_err(|_| GraphError::Checkpoint("checkpoint lock poisoned".into()).into())
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        tracing::debug!(
            thread_id = %checkpoint.thread_id,
            checkpoint_id = %checkpoint.id,
            step = checkpoint.step,
            "saved checkpoint"
        );
        let mut data = self.write()?;
        let thread = data.entry(checkpoint.thread_id.clone()).or_default();

        // Replace if same ID exists, otherwise append
        if let Some(pos) = thread.iter().position(|cp| cp.id == checkpoint.id) {
            thread[pos] = checkpoint;
        } else {
            thread.push(checkpoint);
        }
        Ok(())
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let data = self.read()?;
        let Some(thread) = data.get(thread_id) else {
            return Ok(None);
        };
        Ok(match checkpoint_id {
            Some(id) => thread.iter().find(|cp| cp.id == id).cloned(),
            None => thread.last().cloned(),
        })
    }

    async fn list_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let data = self.read()?;
        Ok(data.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut data = self.write()?;
        data.remove(thread_id);
        Ok(())
    }
}
