// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control store for sync node records.
//!
//! The registry reads every node on each poll; workers write back their own
//! progress through partial updates ([`NodeUpdate`]): status, switch, scan
//! checkpoint and tail checkpoint. A record is never replaced wholesale by
//! the replication path.
//!
//! Two implementations:
//!
//! - [`SqliteControlStore`]: one `sync_nodes` table in a local SQLite file.
//! - [`MemoryControlStore`]: a `DashMap`, for embedding and tests.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (several workers persisting checkpoints at once). Every
//! statement is retried with exponential backoff ([`RetryConfig::busy()`]).
//!
//! ## Checkpoint Semantics
//!
//! Checkpoints are written synchronously and only after the sink confirmed
//! the write they describe:
//!
//! ```text
//! bulk write → sink ok → persist checkpoint
//!              (crash here = replay the batch, idempotent)
//! ```

use crate::error::{ReplicationError, Result};
use crate::node::{FeedPosition, NodeUpdate, SyncNode};
use crate::resilience::RetryConfig;
use crate::source::BoxFuture;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Control-plane persistence required by the registry and workers.
pub trait ControlStore: Send + Sync + 'static {
    /// Every node record.
    fn list_nodes(&self) -> BoxFuture<'_, Vec<SyncNode>>;

    /// One node record.
    fn get_node<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SyncNode>>;

    /// Apply the `Some` fields of `update` to node `id`.
    fn update_node<'a>(&'a self, id: &'a str, update: NodeUpdate) -> BoxFuture<'a, ()>;

    /// Create (or overwrite) a node record.
    fn insert_node(&self, node: SyncNode) -> BoxFuture<'_, ()>;
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let retry = RetryConfig::busy();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::control_store_retries_total(operation_name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Control store backed by SQLite.
pub struct SqliteControlStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteControlStore {
    /// Open (or create) the store at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub async fn new(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing control store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if wal_mode && !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source_url TEXT NOT NULL,
                sink_url TEXT NOT NULL,
                database_name TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                index_name TEXT NOT NULL,
                type_name TEXT NOT NULL,
                mapping TEXT NOT NULL,
                projection TEXT NOT NULL,
                link_field TEXT,
                log_replay INTEGER NOT NULL,
                scan_checkpoint TEXT,
                tail_timestamp INTEGER NOT NULL,
                tail_ordinal INTEGER NOT NULL,
                status TEXT NOT NULL,
                switch TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("control_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Control store closed");
    }

    async fn fetch_all(&self) -> Result<Vec<SyncNode>> {
        let pool = &self.pool;
        let rows = execute_with_retry("control_list", || async {
            sqlx::query("SELECT * FROM sync_nodes ORDER BY id")
                .fetch_all(pool)
                .await
        })
        .await?;

        // A malformed record must not block the other nodes.
        let nodes = rows
            .iter()
            .filter_map(|row| match node_from_row(row) {
                Ok(node) => Some(node),
                Err(e) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    warn!(node_id = %id, error = %e, "Skipping malformed node record");
                    None
                }
            })
            .collect();
        Ok(nodes)
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<SyncNode>> {
        let pool = &self.pool;
        let row = execute_with_retry("control_get", || async {
            sqlx::query("SELECT * FROM sync_nodes WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn apply_update(&self, id: &str, update: NodeUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let pool = &self.pool;
        let now = chrono::Utc::now().timestamp_millis();
        let status = update.status.map(|s| s.as_str());
        let switch = update.switch.map(|s| s.as_str());
        let tail_timestamp = update.tail_checkpoint.map(|p| i64::from(p.timestamp));
        let tail_ordinal = update.tail_checkpoint.map(|p| i64::from(p.ordinal));

        let result = execute_with_retry("control_update", || async {
            sqlx::query(
                r#"
                UPDATE sync_nodes SET
                    status = COALESCE(?, status),
                    switch = COALESCE(?, switch),
                    scan_checkpoint = COALESCE(?, scan_checkpoint),
                    tail_timestamp = COALESCE(?, tail_timestamp),
                    tail_ordinal = COALESCE(?, tail_ordinal),
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(status)
            .bind(switch)
            .bind(update.scan_checkpoint.as_deref())
            .bind(tail_timestamp)
            .bind(tail_ordinal)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReplicationError::NodeNotFound(id.to_string()));
        }

        debug!(node_id = %id, ?update, "Node updated");
        Ok(())
    }

    async fn upsert(&self, node: SyncNode) -> Result<()> {
        let pool = &self.pool;
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("control_insert", || async {
            sqlx::query(
                r#"
                INSERT INTO sync_nodes (
                    id, name, source_url, sink_url, database_name, collection_name,
                    index_name, type_name, mapping, projection, link_field, log_replay,
                    scan_checkpoint, tail_timestamp, tail_ordinal, status, switch, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    source_url = excluded.source_url,
                    sink_url = excluded.sink_url,
                    database_name = excluded.database_name,
                    collection_name = excluded.collection_name,
                    index_name = excluded.index_name,
                    type_name = excluded.type_name,
                    mapping = excluded.mapping,
                    projection = excluded.projection,
                    link_field = excluded.link_field,
                    log_replay = excluded.log_replay,
                    scan_checkpoint = excluded.scan_checkpoint,
                    tail_timestamp = excluded.tail_timestamp,
                    tail_ordinal = excluded.tail_ordinal,
                    status = excluded.status,
                    switch = excluded.switch,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&node.id)
            .bind(&node.name)
            .bind(&node.source_url)
            .bind(&node.sink_url)
            .bind(&node.database)
            .bind(&node.collection)
            .bind(&node.index)
            .bind(&node.type_name)
            .bind(&node.mapping)
            .bind(&node.projection)
            .bind(node.link_field.as_deref())
            .bind(node.log_replay)
            .bind(node.scan_checkpoint.as_deref())
            .bind(i64::from(node.tail_checkpoint.timestamp))
            .bind(i64::from(node.tail_checkpoint.ordinal))
            .bind(node.status.as_str())
            .bind(node.switch.as_str())
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        info!(node_id = %node.id, status = %node.status, "Node stored");
        Ok(())
    }
}

fn node_from_row(row: &SqliteRow) -> Result<SyncNode> {
    let position_part = |column: &str| -> Result<u32> {
        let raw: i64 = row.try_get(column)?;
        u32::try_from(raw)
            .map_err(|_| ReplicationError::Internal(format!("{} out of range: {}", column, raw)))
    };

    Ok(SyncNode {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_url: row.try_get("source_url")?,
        sink_url: row.try_get("sink_url")?,
        database: row.try_get("database_name")?,
        collection: row.try_get("collection_name")?,
        index: row.try_get("index_name")?,
        type_name: row.try_get("type_name")?,
        mapping: row.try_get("mapping")?,
        projection: row.try_get("projection")?,
        link_field: row.try_get("link_field")?,
        log_replay: row.try_get("log_replay")?,
        scan_checkpoint: row.try_get("scan_checkpoint")?,
        tail_checkpoint: FeedPosition::new(
            position_part("tail_timestamp")?,
            position_part("tail_ordinal")?,
        ),
        status: row.try_get::<String, _>("status")?.parse()?,
        switch: row.try_get::<String, _>("switch")?.parse()?,
    })
}

impl ControlStore for SqliteControlStore {
    fn list_nodes(&self) -> BoxFuture<'_, Vec<SyncNode>> {
        Box::pin(self.fetch_all())
    }

    fn get_node<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SyncNode>> {
        Box::pin(self.fetch_one(id))
    }

    fn update_node<'a>(&'a self, id: &'a str, update: NodeUpdate) -> BoxFuture<'a, ()> {
        Box::pin(self.apply_update(id, update))
    }

    fn insert_node(&self, node: SyncNode) -> BoxFuture<'_, ()> {
        Box::pin(self.upsert(node))
    }
}

/// In-memory control store.
#[derive(Default)]
pub struct MemoryControlStore {
    nodes: DashMap<String, SyncNode>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with nodes.
    pub fn with_nodes(nodes: impl IntoIterator<Item = SyncNode>) -> Self {
        let store = Self::new();
        for node in nodes {
            store.nodes.insert(node.id.clone(), node);
        }
        store
    }

    /// Snapshot of one node (synchronous, for tests and diagnostics).
    pub fn snapshot(&self, id: &str) -> Option<SyncNode> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl ControlStore for MemoryControlStore {
    fn list_nodes(&self) -> BoxFuture<'_, Vec<SyncNode>> {
        let mut nodes: Vec<SyncNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Box::pin(async move { Ok(nodes) })
    }

    fn get_node<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SyncNode>> {
        let node = self.snapshot(id);
        Box::pin(async move { Ok(node) })
    }

    fn update_node<'a>(&'a self, id: &'a str, update: NodeUpdate) -> BoxFuture<'a, ()> {
        let result = match self.nodes.get_mut(id) {
            Some(mut node) => {
                update.apply_to(&mut node);
                Ok(())
            }
            None => Err(ReplicationError::NodeNotFound(id.to_string())),
        };
        Box::pin(async move { result })
    }

    fn insert_node(&self, node: SyncNode) -> BoxFuture<'_, ()> {
        self.nodes.insert(node.id.clone(), node);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{SyncStatus, SyncSwitch};
    use tempfile::tempdir;

    fn sample_node(id: &str) -> SyncNode {
        let mut node = SyncNode::new(id, "shop", "orders", "orders");
        node.source_url = "mongodb://localhost:27017".to_string();
        node.sink_url = "http://localhost:9200".to_string();
        node.projection = "sku,qty".to_string();
        node
    }

    #[tokio::test]
    async fn test_sqlite_insert_and_list() {
        let dir = tempdir().unwrap();
        let store = SqliteControlStore::new(dir.path().join("nodes.db"), true)
            .await
            .unwrap();

        store.insert_node(sample_node("b")).await.unwrap();
        store.insert_node(sample_node("a")).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "a");
        assert_eq!(nodes[0], sample_node("a"));

        store.close().await;
    }

    #[tokio::test]
    async fn test_sqlite_partial_update() {
        let dir = tempdir().unwrap();
        let store = SqliteControlStore::new(dir.path().join("nodes.db"), true)
            .await
            .unwrap();
        store.insert_node(sample_node("n1")).await.unwrap();

        store
            .update_node("n1", NodeUpdate::scan_progress("1000"))
            .await
            .unwrap();
        store
            .update_node("n1", NodeUpdate::tail_checkpoint(FeedPosition::new(1700000000, 3)))
            .await
            .unwrap();

        let node = store.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.status, SyncStatus::ProcessScan);
        assert_eq!(node.switch, SyncSwitch::Run);
        assert_eq!(node.scan_checkpoint.as_deref(), Some("1000"));
        assert_eq!(node.tail_checkpoint, FeedPosition::new(1700000000, 3));
        assert_eq!(node.projection, "sku,qty");

        store.close().await;
    }

    #[tokio::test]
    async fn test_sqlite_update_unknown_node() {
        let store = SqliteControlStore::new(":memory:", false).await.unwrap();
        let err = store
            .update_node("ghost", NodeUpdate::switch(SyncSwitch::Stop))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");

        {
            let store = SqliteControlStore::new(&db_path, true).await.unwrap();
            store.insert_node(sample_node("n1")).await.unwrap();
            store
                .update_node("n1", NodeUpdate::failed(SyncStatus::TailException))
                .await
                .unwrap();
            store.close().await;
        }

        {
            let store = SqliteControlStore::new(&db_path, true).await.unwrap();
            let node = store.get_node("n1").await.unwrap().unwrap();
            assert_eq!(node.status, SyncStatus::TailException);
            assert_eq!(node.switch, SyncSwitch::Stop);
            assert!(store.path().contains("persist.db"));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_sqlite_list_skips_malformed_records() {
        let dir = tempdir().unwrap();
        let store = SqliteControlStore::new(dir.path().join("nodes.db"), true)
            .await
            .unwrap();
        store.insert_node(sample_node("good")).await.unwrap();
        store.insert_node(sample_node("bad")).await.unwrap();

        sqlx::query("UPDATE sync_nodes SET status = 'Paused' WHERE id = 'bad'")
            .execute(&store.pool)
            .await
            .unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "good");

        store.close().await;
    }

    #[tokio::test]
    async fn test_sqlite_empty_update_is_noop() {
        let store = SqliteControlStore::new(":memory:", false).await.unwrap();
        assert!(store.update_node("ghost", NodeUpdate::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_update() {
        let store = MemoryControlStore::with_nodes([sample_node("n1")]);
        store
            .update_node("n1", NodeUpdate::switch(SyncSwitch::Stoping))
            .await
            .unwrap();
        assert_eq!(store.snapshot("n1").unwrap().switch, SyncSwitch::Stoping);
        assert!(store.update_node("n2", NodeUpdate::default()).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempt_count += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempt_count += 1;
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
