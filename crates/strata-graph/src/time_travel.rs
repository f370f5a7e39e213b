use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use strata_checkpoint::checkpointer::Checkpointer;
use strata_checkpoint::config_ext::CheckpointConfigExt;
use strata_checkpoint::types::{Checkpoint, CheckpointMetadata, CheckpointSource};
use strata_core::config::RunnableConfig;
use strata_core::error::{GraphError, Result};

use crate::channel::{create_channels, restore_channels, snapshot};
use crate::compiled::{CompiledStateGraph, Frontier};
use crate::constants::START;
use crate::run_loop::build_checkpoint;

/// A read-only view of one checkpoint of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Channel values as the graph sees them.
    pub values: Value,
    /// Nodes that run next if the thread is resumed from here.
    pub next: Vec<String>,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub step: usize,
    pub source: CheckpointSource,
    pub created_at: DateTime<Utc>,
}

impl CompiledStateGraph {
    fn persistence(&self, config: &RunnableConfig) -> Result<(Arc<dyn Checkpointer>, String)> {
        let checkpointer = self
            .checkpointer
            .clone()
            .ok_or_else(|| GraphError::Checkpoint("graph has no checkpointer".into()))?;
        let thread_id = config
            .thread_id()
            .ok_or_else(|| GraphError::Checkpoint("config carries no thread_id".into()))?;
        Ok((checkpointer, thread_id))
    }

    async fn load_for(&self, config: &RunnableConfig) -> Result<Option<Checkpoint>> {
        let (checkpointer, thread_id) = self.persistence(config)?;
        let checkpoint_id = config.checkpoint_id();
        let loaded = checkpointer.load(&thread_id, checkpoint_id.as_deref()).await?;
        match (loaded, checkpoint_id) {
            (None, Some(checkpoint_id)) => Err(GraphError::CheckpointNotFound {
                thread_id,
                checkpoint_id,
            }
            .into()),
            (loaded, _) => Ok(loaded),
        }
    }

    fn to_snapshot(&self, cp: &Checkpoint) -> StateSnapshot {
        let mut channels = create_channels(&self.channel_specs);
        restore_channels(&mut channels, &cp.channel_values);
        StateSnapshot {
            values: snapshot(&channels),
            next: Frontier::from_checkpoint(cp)
                .task_nodes()
                .map(str::to_string)
                .collect(),
            checkpoint_id: cp.id.clone(),
            parent_checkpoint_id: cp.parent_id.clone(),
            step: cp.step,
            source: cp.metadata.source,
            created_at: cp.created_at,
        }
    }

    /// The latest state of the thread in `config`, or the checkpoint it names.
    ///
    /// Returns `Ok(None)` for a thread that has no checkpoints yet.
    pub async fn get_state(&self, config: &RunnableConfig) -> Result<Option<StateSnapshot>> {
        Ok(self.load_for(config).await?.map(|cp| self.to_snapshot(&cp)))
    }

    /// Every checkpoint of the thread in `config`, oldest first.
    pub async fn get_state_history(&self, config: &RunnableConfig) -> Result<Vec<StateSnapshot>> {
        let (checkpointer, thread_id) = self.persistence(config)?;
        let history = checkpointer.list_history(&thread_id).await?;
        Ok(history.iter().map(|cp| self.to_snapshot(cp)).collect())
    }

    /// Write `values` into the thread's state from outside a run.
    ///
    /// The update is reduced onto the latest checkpoint (or the one named in
    /// `config`) and saved as a new checkpoint whose parent is that one. With
    /// `as_node`, the next nodes are recomputed as if that node had just
    /// produced the update; without it the pending frontier is kept.
    ///
    /// Returns the id of the new checkpoint.
    pub async fn update_state(
        &self,
        config: &RunnableConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<String> {
        let (checkpointer, thread_id) = self.persistence(config)?;
        let base = self
            .load_for(config)
            .await?
            .ok_or_else(|| GraphError::ThreadNotFound(thread_id.clone()))?;

        if let Some(node) = as_node {
            if node != START && self.node(node).is_none() {
                return Err(GraphError::InvalidUpdate {
                    node: node.to_string(),
                    message: "no such node in this graph".into(),
                }
                .into());
            }
        }
        let writer = as_node.unwrap_or(START);

        let mut channels = create_channels(&self.channel_specs);
        restore_channels(&mut channels, &base.channel_values);
        let mut writes = Vec::new();
        self.collect_writes(&Uuid::new_v4().to_string(), writer, Some(&values), &mut writes)?;
        self.apply_writes(&mut channels, &writes)?;

        let frontier = match as_node {
            Some(node) => {
                let mut frontier = Frontier {
                    barriers: base.barriers.clone(),
                    ..Frontier::default()
                };
                self.route(node, None, &snapshot(&channels), &mut frontier)?;
                self.settle(&mut frontier);
                frontier
            }
            None => Frontier::from_checkpoint(&base),
        };

        let cp = build_checkpoint(
            &thread_id,
            Some(base.id.clone()),
            base.step + 1,
            &channels,
            &frontier,
            writes,
            CheckpointSource::Update,
            vec![writer.to_string()],
        );
        let id = cp.id.clone();
        checkpointer.save(cp).await?;
        tracing::info!(thread_id = %thread_id, checkpoint_id = %id, parent = %base.id, "state updated");
        Ok(id)
    }
}

/// Fork from a specific checkpoint to create a new thread branch.
///
/// Copies the checkpoint's channel values and pending work into a new
/// checkpoint on `new_thread_id`, allowing independent execution from that
/// point. Returns the id of the new checkpoint.
pub async fn fork_from_checkpoint(
    checkpointer: &dyn Checkpointer,
    source_thread_id: &str,
    checkpoint_id: &str,
    new_thread_id: &str,
) -> Result<String> {
    let checkpoint = checkpointer
        .load(source_thread_id, Some(checkpoint_id))
        .await?
        .ok_or_else(|| GraphError::CheckpointNotFound {
            thread_id: source_thread_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
        })?;

    let id = Uuid::new_v4().to_string();
    let forked = Checkpoint {
        id: id.clone(),
        thread_id: new_thread_id.to_string(),
        parent_id: Some(checkpoint.id.clone()),
        pending_writes: Vec::new(),
        metadata: CheckpointMetadata {
            source: CheckpointSource::Fork,
            step: checkpoint.step,
            writers: Vec::new(),
        },
        created_at: Utc::now(),
        ..checkpoint
    };

    checkpointer.save(forked).await?;
    Ok(id)
}
