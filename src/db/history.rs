use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::DispatchRecord;

/// Check if an item has already been dispatched under a rule
pub fn is_already_dispatched(conn: &Connection, rule_id: &str, item_id: &str) -> Result<bool> {
    let exists: Option<i32> = conn
        .query_row(
            "SELECT 1 FROM dispatch_history WHERE rule_id = ?1 AND item_id = ?2 LIMIT 1",
            params![rule_id, item_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to check if already dispatched")?;

    Ok(exists.is_some())
}

/// Record an acknowledged dispatch. Existing pairs are left untouched.
pub fn record_dispatch(conn: &Connection, record: &DispatchRecord) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO dispatch_history (rule_id, item_id, title, download_url)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            record.rule_id,
            record.item_id,
            record.title,
            record.download_url
        ],
    )
    .context("Failed to record dispatch")?;

    Ok(())
}

/// Get the dispatch history for a specific rule, newest first
pub fn get_rule_history(conn: &Connection, rule_id: &str) -> Result<Vec<DispatchRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT rule_id, item_id, title, download_url, dispatched_at
             FROM dispatch_history
             WHERE rule_id = ?1
             ORDER BY dispatched_at DESC, item_id ASC",
        )
        .context("Failed to prepare get_rule_history query")?;

    let records = stmt
        .query_map([rule_id], |row| {
            Ok(DispatchRecord {
                rule_id: row.get(0)?,
                item_id: row.get(1)?,
                title: row.get(2)?,
                download_url: row.get(3)?,
                dispatched_at: row.get(4)?,
            })
        })
        .context("Failed to execute get_rule_history query")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect dispatch records")?;

    Ok(records)
}

/// Delete records older than `days` days. Returns the number removed.
pub fn prune_older_than(conn: &Connection, days: u32) -> Result<usize> {
    let modifier = format!("-{} days", days);
    let removed = conn
        .execute(
            "DELETE FROM dispatch_history WHERE dispatched_at < datetime('now', ?1)",
            params![modifier],
        )
        .context("Failed to prune dispatch history")?;

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_database;

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        conn
    }

    fn record(rule: &str, item: &str) -> DispatchRecord {
        DispatchRecord {
            rule_id: rule.to_string(),
            item_id: item.to_string(),
            title: format!("title {}", item),
            download_url: format!("https://tracker.example/{}.torrent", item),
            dispatched_at: None,
        }
    }

    #[test]
    fn test_is_already_dispatched_false() {
        let conn = setup_test_db();

        let result = is_already_dispatched(&conn, "r1", "nonexistent").unwrap();
        assert!(!result);
    }

    #[test]
    fn test_record_and_check_dispatch() {
        let conn = setup_test_db();

        record_dispatch(&conn, &record("r1", "x1")).unwrap();

        assert!(is_already_dispatched(&conn, "r1", "x1").unwrap());
    }

    #[test]
    fn test_pairs_are_independent_per_rule() {
        let conn = setup_test_db();

        record_dispatch(&conn, &record("r1", "x1")).unwrap();

        assert!(!is_already_dispatched(&conn, "r2", "x1").unwrap());
    }

    #[test]
    fn test_duplicate_record_is_ignored() {
        let conn = setup_test_db();

        record_dispatch(&conn, &record("r1", "x1")).unwrap();
        record_dispatch(&conn, &record("r1", "x1")).unwrap();

        let history = get_rule_history(&conn, "r1").unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_get_rule_history() {
        let conn = setup_test_db();

        record_dispatch(&conn, &record("r1", "a")).unwrap();
        record_dispatch(&conn, &record("r1", "b")).unwrap();
        record_dispatch(&conn, &record("r2", "c")).unwrap();

        let history = get_rule_history(&conn, "r1").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.rule_id == "r1"));
        assert!(history[0].dispatched_at.is_some());
    }

    #[test]
    fn test_prune_older_than() {
        let conn = setup_test_db();

        record_dispatch(&conn, &record("r1", "old")).unwrap();
        record_dispatch(&conn, &record("r1", "new")).unwrap();
        conn.execute(
            "UPDATE dispatch_history SET dispatched_at = datetime('now', '-40 days') WHERE item_id = 'old'",
            [],
        )
        .unwrap();

        let removed = prune_older_than(&conn, 30).unwrap();

        assert_eq!(removed, 1);
        assert!(!is_already_dispatched(&conn, "r1", "old").unwrap());
        assert!(is_already_dispatched(&conn, "r1", "new").unwrap());
    }
}
