use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use strata_core::error::{GraphError, Result};

use crate::checkpointer::Checkpointer;
use crate::types::Checkpoint;

/// SQLite-backed checkpointer for durable persistence.
///
/// Thread-safe via `Arc<Mutex<Connection>>`. All SQLite operations are
/// dispatched to a blocking thread via `tokio::task::spawn_blocking`.
/// Checkpoints are stored as JSON payloads; `seq` preserves save order.
pub struct SqliteCheckpointer {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointer {
    /// Open (or create) a SQLite database at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| GraphError::Checkpoint(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| GraphError::Checkpoint(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_table()?;
        Ok(store)
    }

    fn create_table(&self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                parent_id TEXT,
                step INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (thread_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
                ON checkpoints(thread_id, seq);",
        )
        .map_err(|e| GraphError::Checkpoint(format!("failed to create table: {e}")))?;
        Ok(())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| GraphError::Checkpoint("sqlite connection lock poisoned".into()).into())
}

fn decode(payload: &str) -> Result<Checkpoint> {
    serde_json::from_str(payload)
        .map_err(|e| GraphError::Checkpoint(format!("decode checkpoint: {e}")).into())
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let payload = serde_json::to_string(&checkpoint)
                .map_err(|e| GraphError::Checkpoint(format!("serialize checkpoint: {e}")))?;

            conn.execute(
                "INSERT INTO checkpoints (id, thread_id, parent_id, step, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (thread_id, id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    step = excluded.step,
                    payload = excluded.payload,
                    created_at = excluded.created_at",
                params![
                    checkpoint.id,
                    checkpoint.thread_id,
                    checkpoint.parent_id,
                    checkpoint.step as i64,
                    payload,
                    checkpoint.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| GraphError::Checkpoint(format!("insert checkpoint: {e}")))?;

            tracing::debug!(
                thread_id = %checkpoint.thread_id,
                checkpoint_id = %checkpoint.id,
                step = checkpoint.step,
                "saved checkpoint"
            );
            Ok(())
        })
        .await
        .map_err(|e| GraphError::Checkpoint(format!("spawn_blocking: {e}")))?
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_owned();
        let checkpoint_id = checkpoint_id.map(str::to_owned);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let payload: Option<String> = match checkpoint_id {
                Some(id) => conn
                    .query_row(
                        "SELECT payload FROM checkpoints WHERE thread_id = ?1 AND id = ?2",
                        params![thread_id, id],
                        |row| row.get(0),
                    )
                    .optional(),
                None => conn
                    .query_row(
                        "SELECT payload FROM checkpoints
                         WHERE thread_id = ?1
                         ORDER BY seq DESC
                         LIMIT 1",
                        params![thread_id],
                        |row| row.get(0),
                    )
                    .optional(),
            }
            .map_err(|e| GraphError::Checkpoint(format!("query: {e}")))?;

            payload.as_deref().map(decode).transpose()
        })
        .await
        .map_err(|e| GraphError::Checkpoint(format!("spawn_blocking: {e}")))?
    }

    async fn list_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM checkpoints
                     WHERE thread_id = ?1
                     ORDER BY seq ASC",
                )
                .map_err(|e| GraphError::Checkpoint(format!("prepare: {e}")))?;

            let rows = stmt
                .query_map(params![thread_id], |row| row.get::<_, String>(0))
                .map_err(|e| GraphError::Checkpoint(format!("query: {e}")))?;

            let mut checkpoints = Vec::new();
            for row in rows {
                let payload =
                    row.map_err(|e| GraphError::Checkpoint(format!("read row: {e}")))?;
                checkpoints.push(decode(&payload)?);
            }

            Ok(checkpoints)
        })
        .await
        .map_err(|e| GraphError::Checkpoint(format!("spawn_blocking: {e}")))?
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "DELETE FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(|e| GraphError::Checkpoint(format!("delete: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GraphError::Checkpoint(format!("spawn_blocking: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::SendDirective;
    use crate::types::{CheckpointMetadata, CheckpointSource, PendingWrite};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    fn make_checkpoint(id: &str, thread_id: &str, step: usize) -> Checkpoint {
        Checkpoint {
            id: id.into(),
            thread_id: thread_id.into(),
            parent_id: if step > 0 {
                Some(format!("cp-{}", step - 1))
            } else {
                None
            },
            step,
            channel_values: HashMap::from([("count".into(), json!(step))]),
            pending_writes: vec![],
            next_nodes: vec![format!("node_{step}")],
            pending_sends: vec![],
            barriers: BTreeMap::new(),
            metadata: CheckpointMetadata {
                source: CheckpointSource::Loop,
                step,
                writers: vec![format!("node_{step}")],
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        let cp = make_checkpoint("cp-0", "thread-1", 0);
        store.save(cp.clone()).await.unwrap();

        let retrieved = store.load("thread-1", Some("cp-0")).await.unwrap().unwrap();
        assert_eq!(retrieved.id, "cp-0");
        assert_eq!(retrieved.thread_id, "thread-1");
        assert_eq!(retrieved.step, 0);
        assert!(retrieved.parent_id.is_none());
    }

    #[tokio::test]
    async fn load_nonexistent() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        assert!(store.load("no-thread", Some("no-cp")).await.unwrap().is_none());
        assert!(store.load("no-thread", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_latest_follows_save_order() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        store.save(make_checkpoint("cp-0", "thread-1", 0)).await.unwrap();
        store.save(make_checkpoint("cp-1", "thread-1", 1)).await.unwrap();
        store.save(make_checkpoint("cp-2", "thread-1", 2)).await.unwrap();
        store.save(make_checkpoint("fork-1", "thread-1", 1)).await.unwrap();

        let latest = store.load("thread-1", None).await.unwrap().unwrap();
        assert_eq!(latest.id, "fork-1");
    }

    #[tokio::test]
    async fn history_in_save_order() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        store.save(make_checkpoint("cp-2", "thread-1", 2)).await.unwrap();
        store.save(make_checkpoint("cp-0", "thread-1", 0)).await.unwrap();
        store.save(make_checkpoint("cp-1", "thread-1", 1)).await.unwrap();

        let list = store.list_history("thread-1").await.unwrap();
        let ids: Vec<&str> = list.iter().map(|cp| cp.id.as_str()).collect();
        assert_eq!(ids, vec!["cp-2", "cp-0", "cp-1"]);
    }

    #[tokio::test]
    async fn separate_threads() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        store.save(make_checkpoint("cp-a", "thread-a", 0)).await.unwrap();
        store.save(make_checkpoint("cp-b", "thread-b", 0)).await.unwrap();

        assert!(store.load("thread-a", Some("cp-a")).await.unwrap().is_some());
        assert!(store.load("thread-a", Some("cp-b")).await.unwrap().is_none());
        assert_eq!(store.list_history("thread-b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_thread_leaves_others() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        store.save(make_checkpoint("cp-0", "thread-1", 0)).await.unwrap();
        store.save(make_checkpoint("cp-x", "thread-2", 0)).await.unwrap();

        store.delete_thread("thread-1").await.unwrap();
        assert!(store.load("thread-1", None).await.unwrap().is_none());
        assert!(store.load("thread-2", Some("cp-x")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overwrite_keeps_position() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        let mut cp = make_checkpoint("cp-0", "thread-1", 0);
        store.save(cp.clone()).await.unwrap();
        store.save(make_checkpoint("cp-1", "thread-1", 1)).await.unwrap();

        cp.channel_values.insert("count".into(), json!(999));
        store.save(cp).await.unwrap();

        let list = store.list_history("thread-1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "cp-0");
        assert_eq!(list[0].channel_values["count"], json!(999));
    }

    #[tokio::test]
    async fn full_payload_roundtrip() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        let mut cp = make_checkpoint("cp-0", "thread-1", 0);
        cp.channel_values = HashMap::from([
            ("messages".into(), json!([{"role": "user", "content": "hello"}])),
            ("nested".into(), json!({"a": {"b": [1, 2, 3]}})),
        ]);
        cp.pending_writes = vec![PendingWrite {
            task_id: "task-1".into(),
            node: "agent".into(),
            channel: "messages".into(),
            value: json!({"role": "user", "content": "hello"}),
        }];
        cp.pending_sends = vec![SendDirective::new("worker", json!({"n": 1}))];
        cp.barriers = BTreeMap::from([("join".into(), BTreeSet::from(["left".to_string()]))]);
        store.save(cp.clone()).await.unwrap();

        let retrieved = store.load("thread-1", Some("cp-0")).await.unwrap().unwrap();
        assert_eq!(retrieved, cp);
    }

    #[tokio::test]
    async fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        {
            let store = SqliteCheckpointer::new(&path).unwrap();
            store.save(make_checkpoint("cp-0", "thread-1", 0)).await.unwrap();
        }
        let reopened = SqliteCheckpointer::new(&path).unwrap();
        let cp = reopened.load("thread-1", None).await.unwrap().unwrap();
        assert_eq!(cp.id, "cp-0");
    }

    #[tokio::test]
    async fn delete_nonexistent_thread_is_ok() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        store.delete_thread("nonexistent").await.unwrap();
    }
}
