use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Configuration for a single graph run.
///
/// Everything except the cancellation token is serializable, so a config can
/// be loaded from JSON and shipped between processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnableConfig {
    /// Tags for filtering and categorization.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Arbitrary metadata key-value pairs.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Maximum number of supersteps (including nested subgraph steps) per run.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,

    /// Unique identifier for this run.
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,

    /// Arbitrary configurable values, passed opaquely to every node.
    #[serde(default)]
    pub configurable: HashMap<String, serde_json::Value>,

    /// Upper bound for a single node invocation. A node may override it.
    #[serde(default)]
    pub node_timeout: Option<Duration>,

    /// Upper bound for the whole run.
    #[serde(default)]
    pub run_timeout: Option<Duration>,

    /// Token observed by the scheduler; cancelling it aborts the current round.
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

fn default_recursion_limit() -> usize {
    25
}

impl Default for RunnableConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            metadata: HashMap::new(),
            recursion_limit: default_recursion_limit(),
            run_id: Uuid::new_v4(),
            configurable: HashMap::new(),
            node_timeout: None,
            run_timeout: None,
            cancellation: None,
        }
    }
}

impl RunnableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Set an entry in the `configurable` bag.
    pub fn with_configurable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Read a value from the `configurable` bag.
    pub fn configurable_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.configurable.get(key)
    }

    /// Whether the run's cancellation token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}
