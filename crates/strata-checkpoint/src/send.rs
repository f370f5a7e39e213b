use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directive to run a node in the next superstep with a private input.
///
/// The target node receives `arg` as its state instead of the shared graph
/// state. Several directives may target the same node; each becomes its own
/// task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendDirective {
    /// Target node name to execute.
    pub node: String,
    /// Private input handed to the target node.
    pub arg: Value,
}

impl SendDirective {
    /// Create a new send directive.
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }
}
