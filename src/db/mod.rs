pub mod history;
pub mod rules;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error;
use crate::models::DispatchRecord;

/// Durable record of which (rule, item) pairs were already dispatched
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn already_dispatched(&self, rule_id: &str, item_id: &str) -> error::Result<bool>;

    /// Record an acknowledged dispatch. Committing an existing pair is a no-op.
    async fn commit(&self, record: &DispatchRecord) -> error::Result<()>;
}

/// SQLite database handle wrapped in a Mutex for thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // The dedup records must survive a crash right after commit
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        tracing::debug!("SQLite journal mode: {}", mode);
        conn.execute_batch("PRAGMA synchronous = FULL;")
            .context("Failed to set synchronous mode")?;

        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a blocking database operation while holding the connection lock
    pub async fn with_db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let conn = self.conn.lock().await;

        // rusqlite is sync; the lock serialises access and statements are short
        f(&conn)
    }
}

fn store_error(err: anyhow::Error) -> error::Error {
    error::Error::Store(format!("{:#}", err))
}

#[async_trait]
impl DedupStore for Database {
    async fn already_dispatched(&self, rule_id: &str, item_id: &str) -> error::Result<bool> {
        self.with_db(|conn| history::is_already_dispatched(conn, rule_id, item_id))
            .await
            .map_err(store_error)
    }

    async fn commit(&self, record: &DispatchRecord) -> error::Result<()> {
        self.with_db(|conn| history::record_dispatch(conn, record))
            .await
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rule: &str, item: &str) -> DispatchRecord {
        DispatchRecord {
            rule_id: rule.to_string(),
            item_id: item.to_string(),
            title: "Show.S01E02".to_string(),
            download_url: "https://tracker.example/1.torrent".to_string(),
            dispatched_at: None,
        }
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.db");

        {
            let db = Database::open(&path).unwrap();
            db.commit(&record("r1", "x1")).await.unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.already_dispatched("r1", "x1").await.unwrap());
        assert!(!db.already_dispatched("r1", "x2").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_commits_for_different_keys() {
        let db = Database::open_in_memory().unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.commit(&record("r1", &format!("item-{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for i in 0..16 {
            assert!(db.already_dispatched("r1", &format!("item-{}", i)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_commit_twice_is_noop() {
        let db = Database::open_in_memory().unwrap();
        db.commit(&record("r1", "x1")).await.unwrap();
        db.commit(&record("r1", "x1")).await.unwrap();

        let count = db
            .with_db(|conn| history::get_rule_history(conn, "r1"))
            .await
            .unwrap()
            .len();
        assert_eq!(count, 1);
    }
}
