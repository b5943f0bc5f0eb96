use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all database tables if they don't exist
pub fn init_database(conn: &Connection) -> Result<()> {
    // One row per acknowledged (rule, item) dispatch
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dispatch_history (
            rule_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            download_url TEXT NOT NULL DEFAULT '',
            dispatched_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (rule_id, item_id)
        )",
        [],
    )
    .context("Failed to create dispatch_history table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dispatch_history_dispatched_at
         ON dispatch_history (dispatched_at)",
        [],
    )
    .context("Failed to create dispatch_history index")?;

    // Rules created through the control surface or seeded from config
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            feed_id TEXT NOT NULL,
            pattern TEXT NOT NULL,
            pattern_kind TEXT NOT NULL DEFAULT 'substring',
            exclude TEXT,
            match_link INTEGER NOT NULL DEFAULT 0,
            save_path TEXT,
            category TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        )",
        [],
    )
    .context("Failed to create rules table")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_init_database() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"dispatch_history".to_string()));
        assert!(tables.contains(&"rules".to_string()));
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
    }
}
