use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the Strata engine.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// The graph error behind this error, if any.
    pub fn as_graph(&self) -> Option<&GraphError> {
        match self {
            StrataError::Graph(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph definition is invalid. Raised by `compile()` before any run starts.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Recursion limit ({limit}) exceeded")]
    RecursionLimit { limit: usize },

    #[error("Reducer for channel '{channel}' failed on write from '{node}': {message}")]
    StateReduction {
        channel: String,
        node: String,
        message: String,
    },

    #[error("Node '{node}' routed to unknown destination '{target}'")]
    Routing { node: String, target: String },

    #[error("Node error in '{node}': {source}")]
    NodeExecution {
        node: String,
        source: Box<StrataError>,
    },

    #[error("Node '{node}' timed out after {timeout:?}")]
    NodeTimeout { node: String, timeout: Duration },

    #[error("Run timed out after {timeout:?}")]
    RunTimeout { timeout: Duration },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid update from '{node}': {message}")]
    InvalidUpdate { node: String, message: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint '{checkpoint_id}' not found for thread '{thread_id}'")]
    CheckpointNotFound {
        thread_id: String,
        checkpoint_id: String,
    },

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::RecursionLimit { limit: 25 };
        assert_eq!(err.to_string(), "Recursion limit (25) exceeded");
    }

    #[test]
    fn state_reduction_names_channel_and_node() {
        let err = GraphError::StateReduction {
            channel: "total".into(),
            node: "adder".into(),
            message: "not a number".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("total"));
        assert!(msg.contains("adder"));
        assert!(msg.contains("not a number"));
    }

    #[test]
    fn routing_error_display() {
        let err = GraphError::Routing {
            node: "router".into(),
            target: "nowhere".into(),
        };
        assert_eq!(
            err.to_string(),
            "Node 'router' routed to unknown destination 'nowhere'"
        );
    }

    #[test]
    fn node_timeout_display() {
        let err = GraphError::NodeTimeout {
            node: "slow".into(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("slow"));
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn strata_error_from_graph_error() {
        let graph_err = GraphError::InvalidGraph("no START edge".into());
        let err: StrataError = graph_err.into();
        assert!(matches!(err, StrataError::Graph(GraphError::InvalidGraph(_))));
        assert!(err.as_graph().is_some());
    }

    #[test]
    fn strata_error_from_store_error() {
        let err: StrataError = StoreError::InvalidNamespace("empty label".into()).into();
        assert!(matches!(err, StrataError::Store(StoreError::InvalidNamespace(_))));
        assert!(err.as_graph().is_none());
    }

    #[test]
    fn graph_error_node_execution() {
        let inner = StrataError::Other("something broke".into());
        let err = GraphError::NodeExecution {
            node: "agent".into(),
            source: Box::new(inner),
        };
        assert!(err.to_string().contains("agent"));
        assert!(err.to_string().contains("something broke"));
    }

    #[test]
    fn thread_not_found_is_distinct_from_checkpoint_not_found() {
        let a = GraphError::ThreadNotFound("t-1".into());
        let b = GraphError::CheckpointNotFound {
            thread_id: "t-1".into(),
            checkpoint_id: "cp-9".into(),
        };
        assert_ne!(a.to_string(), b.to_string());
    }
}
