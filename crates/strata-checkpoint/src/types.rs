use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::send::SendDirective;

/// An immutable snapshot of graph state taken after a superstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier for this checkpoint.
    pub id: String,
    /// Thread (conversation) identifier. Multiple checkpoints share a thread.
    pub thread_id: String,
    /// Parent checkpoint ID, forming a linked-list history.
    pub parent_id: Option<String>,
    /// The superstep number at which this checkpoint was taken.
    pub step: usize,
    /// Snapshot of all channel values (key → serialized channel state).
    pub channel_values: HashMap<String, Value>,
    /// Writes reduced into this checkpoint, in reduction order.
    #[serde(default)]
    pub pending_writes: Vec<PendingWrite>,
    /// Names of the nodes that run in the next superstep.
    pub next_nodes: Vec<String>,
    /// Send tasks scheduled for the next superstep.
    #[serde(default)]
    pub pending_sends: Vec<SendDirective>,
    /// Deferred node → predecessors that already delivered a completion.
    #[serde(default)]
    pub barriers: BTreeMap<String, BTreeSet<String>>,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Whether the run would do nothing more if resumed from here.
    pub fn is_terminal(&self) -> bool {
        self.next_nodes.is_empty() && self.pending_sends.is_empty() && self.barriers.is_empty()
    }
}

/// A single channel write produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub node: String,
    pub channel: String,
    pub value: Value,
}

/// How a checkpoint came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// The run input was committed.
    Input,
    /// A superstep was committed.
    Loop,
    /// The run was suspended before a breakpoint node.
    Interrupt,
    /// State was edited from outside the run.
    Update,
    /// Copied from another thread.
    Fork,
}

/// Metadata describing how a checkpoint was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// The execution step number.
    pub step: usize,
    /// Nodes whose writes produced this checkpoint.
    #[serde(default)]
    pub writers: Vec<String>,
}

/// The outcome of a graph run.
#[derive(Debug, Clone)]
pub enum GraphOutput {
    /// Graph completed normally with final state.
    Complete(Value),
    /// Graph was suspended at a breakpoint.
    Interrupted {
        /// The checkpoint ID from which execution can be resumed.
        checkpoint_id: String,
        /// Describes the breakpoint that fired.
        interrupt_value: Value,
        /// Current graph state at the point of interruption.
        state: Value,
    },
}

impl GraphOutput {
    /// Returns `true` if the graph completed normally.
    pub fn is_complete(&self) -> bool {
        matches!(self, GraphOutput::Complete(_))
    }

    /// Returns `true` if the graph was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, GraphOutput::Interrupted { .. })
    }

    /// The state carried by this outcome, final or at the interruption point.
    pub fn into_value(self) -> Value {
        match self {
            GraphOutput::Complete(v) => v,
            GraphOutput::Interrupted { state, .. } => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Checkpoint {
        Checkpoint {
            id: "cp-1".into(),
            thread_id: "thread-1".into(),
            parent_id: None,
            step: 0,
            channel_values: HashMap::from([("count".into(), json!(42))]),
            pending_writes: vec![PendingWrite {
                task_id: "t-0".into(),
                node: "node_a".into(),
                channel: "count".into(),
                value: json!(42),
            }],
            next_nodes: vec!["node_b".into()],
            pending_sends: vec![],
            barriers: BTreeMap::new(),
            metadata: CheckpointMetadata {
                source: CheckpointSource::Loop,
                step: 0,
                writers: vec!["node_a".into()],
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn checkpoint_serde_roundtrip() {
        let cp = sample();
        let json = serde_json::to_string(&cp).unwrap();
        let deserialized: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, cp);
    }

    #[test]
    fn checkpoint_source_snake_case() {
        assert_eq!(
            serde_json::to_value(CheckpointSource::Interrupt).unwrap(),
            json!("interrupt")
        );
    }

    #[test]
    fn older_payload_without_optional_fields() {
        let raw = json!({
            "id": "cp-0",
            "thread_id": "t",
            "parent_id": null,
            "step": 0,
            "channel_values": {},
            "next_nodes": [],
            "metadata": {"source": "input", "step": 0},
            "created_at": "2024-01-01T00:00:00Z"
        });
        let cp: Checkpoint = serde_json::from_value(raw).unwrap();
        assert!(cp.pending_writes.is_empty());
        assert!(cp.is_terminal());
    }

    #[test]
    fn terminal_requires_no_pending_work() {
        let mut cp = sample();
        assert!(!cp.is_terminal());
        cp.next_nodes.clear();
        assert!(cp.is_terminal());
        cp.pending_sends.push(SendDirective::new("w", json!(1)));
        assert!(!cp.is_terminal());
    }

    #[test]
    fn graph_output_complete() {
        let output = GraphOutput::Complete(json!({"result": "done"}));
        assert!(output.is_complete());
        assert!(!output.is_interrupted());
        assert_eq!(output.into_value(), json!({"result": "done"}));
    }

    #[test]
    fn graph_output_interrupted() {
        let output = GraphOutput::Interrupted {
            checkpoint_id: "cp-1".into(),
            interrupt_value: json!({"breakpoint": "before", "node": "review"}),
            state: json!({"count": 5}),
        };
        assert!(output.is_interrupted());
        assert_eq!(output.into_value(), json!({"count": 5}));
    }
}
