use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_core::error::{Result, StoreError};

/// A value stored under a hierarchical namespace and key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional refinements for [`BaseStore::search`].
///
/// `filter` matches top-level fields of object values exactly. `query` is a
/// case-insensitive substring match against the serialized value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether `value` satisfies the filter and text query.
    pub fn matches(&self, value: &Value) -> bool {
        if !self.filter.is_empty() {
            let Some(obj) = value.as_object() else {
                return false;
            };
            if !self
                .filter
                .iter()
                .all(|(field, expected)| obj.get(field) == Some(expected))
            {
                return false;
            }
        }
        match &self.query {
            Some(q) => value
                .to_string()
                .to_lowercase()
                .contains(&q.to_lowercase()),
            None => true,
        }
    }
}

/// Cross-thread key-value store shared by every run of a graph.
///
/// Namespaces are hierarchical: a search over `["memories"]` sees every item
/// stored under `["memories", <anything>...]`. The store lives independently
/// of threads and checkpoints.
#[async_trait]
pub trait BaseStore: Send + Sync {
    /// Insert or overwrite an item.
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()>;

    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<Item>>;

    /// Items whose namespace starts with `namespace_prefix`, in a stable order.
    async fn search(&self, namespace_prefix: &[&str], query: SearchQuery) -> Result<Vec<Item>>;

    /// Remove an item. Deleting a missing key is not an error.
    async fn delete(&self, namespace: &[&str], key: &str) -> Result<()>;

    /// Distinct namespaces under `prefix`, truncated to `max_depth` labels.
    async fn list_namespaces(
        &self,
        prefix: &[&str],
        max_depth: Option<usize>,
    ) -> Result<Vec<Vec<String>>>;
}

/// Reject namespaces that cannot address an item.
pub fn validate_namespace(namespace: &[&str]) -> Result<()> {
    if namespace.is_empty() {
        return Err(StoreError::InvalidNamespace("namespace cannot be empty".into()).into());
    }
    if let Some(label) = namespace.iter().find(|l| l.is_empty()) {
        return Err(StoreError::InvalidNamespace(format!(
            "empty label in namespace {namespace:?} ({label:?})"
        ))
        .into());
    }
    Ok(())
}
