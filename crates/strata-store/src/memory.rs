use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use strata_core::error::{Result, StoreError};

use crate::base::{validate_namespace, BaseStore, Item, SearchQuery};

type ItemKey = (Vec<String>, String);

#[derive(Default)]
struct Entries {
    items: HashMap<ItemKey, (u64, Item)>,
    next_seq: u64,
}

/// In-memory store for tests and single-process deployments.
///
/// Search results come back in insertion order. Overwriting an item keeps its
/// original position and `created_at`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Entries>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()).into())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()).into())
    }
}

fn owned(namespace: &[&str]) -> Vec<String> {
    namespace.iter().map(|s| s.to_string()).collect()
}

fn has_prefix(namespace: &[String], prefix: &[&str]) -> bool {
    namespace.len() >= prefix.len() && namespace.iter().zip(prefix).all(|(a, b)| a == b)
}

#[async_trait]
impl BaseStore for InMemoryStore {
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()> {
        validate_namespace(namespace)?;
        let mut entries = self.write()?;
        let now = Utc::now();
        let id = (owned(namespace), key.to_string());

        if let Some((_, item)) = entries.items.get_mut(&id) {
            item.value = value;
            item.updated_at = now;
        } else {
            let seq = entries.next_seq;
            entries.next_seq += 1;
            let item = Item {
                namespace: id.0.clone(),
                key: key.to_string(),
                value,
                created_at: now,
                updated_at: now,
            };
            entries.items.insert(id, (seq, item));
        }
        tracing::debug!(?namespace, key, "store put");
        Ok(())
    }

    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<Item>> {
        let entries = self.read()?;
        Ok(entries
            .items
            .get(&(owned(namespace), key.to_string()))
            .map(|(_, item)| item.clone()))
    }

    async fn search(&self, namespace_prefix: &[&str], query: SearchQuery) -> Result<Vec<Item>> {
        let entries = self.read()?;
        let mut hits: Vec<&(u64, Item)> = entries
            .items
            .values()
            .filter(|(_, item)| has_prefix(&item.namespace, namespace_prefix))
            .filter(|(_, item)| query.matches(&item.value))
            .collect();
        hits.sort_by_key(|(seq, _)| *seq);

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn delete(&self, namespace: &[&str], key: &str) -> Result<()> {
        let mut entries = self.write()?;
        entries.items.remove(&(owned(namespace), key.to_string()));
        Ok(())
    }

    async fn list_namespaces(
        &self,
        prefix: &[&str],
        max_depth: Option<usize>,
    ) -> Result<Vec<Vec<String>>> {
        let entries = self.read()?;
        let namespaces: BTreeSet<Vec<String>> = entries
            .items
            .values()
            .filter(|(_, item)| has_prefix(&item.namespace, prefix))
            .map(|(_, item)| match max_depth {
                Some(depth) => item.namespace.iter().take(depth).cloned().collect(),
                None => item.namespace.clone(),
            })
            .collect();
        Ok(namespaces.into_iter().collect())
    }
}
