use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::send::SendDirective;

/// Which graph a command is addressed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandGraph {
    /// The graph the emitting node belongs to.
    #[default]
    Current,
    /// The graph that invoked the current graph as a subgraph node.
    Parent,
}

/// A single routing target of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Goto {
    /// Activate a node with the shared state.
    Node(String),
    /// Run a node with a private input.
    Send(SendDirective),
}

impl Goto {
    /// Name of the node this target activates.
    pub fn node(&self) -> &str {
        match self {
            Goto::Node(name) => name,
            Goto::Send(send) => &send.node,
        }
    }
}

impl From<&str> for Goto {
    fn from(name: &str) -> Self {
        Goto::Node(name.to_string())
    }
}

impl From<String> for Goto {
    fn from(name: String) -> Self {
        Goto::Node(name)
    }
}

impl From<SendDirective> for Goto {
    fn from(send: SendDirective) -> Self {
        Goto::Send(send)
    }
}

/// A node's combined state update and control transfer.
///
/// `update` is reduced into the state exactly like a plain partial-state
/// return value. A non-empty `goto` replaces edge-based routing for the
/// emitting node's outgoing transition.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use strata_checkpoint::command::Command;
///
/// let cmd = Command::goto("review").with_update(json!({"draft": "v1"}));
/// assert_eq!(cmd.goto[0].node(), "review");
/// assert!(cmd.update.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "explicit_update"
    )]
    pub update: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goto: Vec<Goto>,
    #[serde(default)]
    pub graph: CommandGraph,
}

/// An `update` key that is present stays `Some`, even when it holds `null`.
fn explicit_update<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    /// A command that routes to `target` without updating state.
    pub fn goto(target: impl Into<Goto>) -> Self {
        Self {
            goto: vec![target.into()],
            ..Self::default()
        }
    }

    /// A command that only updates state; routing falls back to edges.
    pub fn update(update: Value) -> Self {
        Self {
            update: Some(update),
            ..Self::default()
        }
    }

    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    /// Add another routing target.
    pub fn with_goto(mut self, target: impl Into<Goto>) -> Self {
        self.goto.push(target.into());
        self
    }

    /// Add a send directive as a routing target.
    pub fn with_send(self, send: SendDirective) -> Self {
        self.with_goto(send)
    }

    /// Address this command to the parent graph.
    pub fn to_parent(mut self) -> Self {
        self.graph = CommandGraph::Parent;
        self
    }

    pub fn is_parent(&self) -> bool {
        self.graph == CommandGraph::Parent
    }

    pub fn has_goto(&self) -> bool {
        !self.goto.is_empty()
    }
}
