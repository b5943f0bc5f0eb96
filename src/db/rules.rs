//! Rule persistence
//!
//! Rules from the config file are upserted on start; rules created through the
//! control surface live only here.

use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params};

use crate::models::{PatternKind, RuleSpec};

const RULE_COLUMNS: &str =
    "id, feed_id, pattern, pattern_kind, exclude, match_link, save_path, category, enabled";

fn pattern_kind_from_str(s: &str) -> PatternKind {
    match s {
        "regex" => PatternKind::Regex,
        _ => PatternKind::Substring,
    }
}

fn row_to_rule(row: &Row) -> rusqlite::Result<RuleSpec> {
    Ok(RuleSpec {
        id: row.get(0)?,
        feed: row.get(1)?,
        pattern: row.get(2)?,
        pattern_kind: pattern_kind_from_str(&row.get::<_, String>(3)?),
        exclude: row.get(4)?,
        match_link: row.get::<_, i32>(5)? != 0,
        save_path: row.get(6)?,
        category: row.get(7)?,
        enabled: row.get::<_, i32>(8)? != 0,
    })
}

/// Get all rules ordered by id
pub fn get_all_rules(conn: &Connection) -> Result<Vec<RuleSpec>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM rules ORDER BY id ASC", RULE_COLUMNS))
        .context("Failed to prepare get_all_rules statement")?;

    let rules = stmt
        .query_map([], row_to_rule)
        .context("Failed to query rules")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to read rule rows")?;

    Ok(rules)
}

/// Insert a rule, or replace every field of an existing one with the same id
pub fn upsert_rule(conn: &Connection, rule: &RuleSpec) -> Result<()> {
    conn.execute(
        "INSERT INTO rules (id, feed_id, pattern, pattern_kind, exclude, match_link, save_path, category, enabled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            feed_id = excluded.feed_id,
            pattern = excluded.pattern,
            pattern_kind = excluded.pattern_kind,
            exclude = excluded.exclude,
            match_link = excluded.match_link,
            save_path = excluded.save_path,
            category = excluded.category,
            enabled = excluded.enabled,
            updated_at = datetime('now')",
        params![
            rule.id,
            rule.feed,
            rule.pattern,
            rule.pattern_kind.as_str(),
            rule.exclude,
            rule.match_link as i32,
            rule.save_path,
            rule.category,
            rule.enabled as i32
        ],
    )
    .with_context(|| format!("Failed to save rule {}", rule.id))?;

    Ok(())
}

/// Toggle a rule's enabled flag. Returns false if the rule does not exist.
pub fn set_rule_enabled(conn: &Connection, id: &str, enabled: bool) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE rules SET enabled = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![enabled as i32, id],
        )
        .context("Failed to set rule enabled state")?;

    Ok(changed > 0)
}

/// Delete a rule. Its dispatch history is kept so a re-created rule with the
/// same id does not download everything again.
pub fn delete_rule(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn
        .execute("DELETE FROM rules WHERE id = ?1", [id])
        .context("Failed to delete rule")?;

    Ok(changed > 0)
}
