// entity_references table: derived links such as mentions.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

pub const MENTION: &str = "mention";

pub struct ReferenceStore;

impl ReferenceStore {
    /// Replace all references of `kind` from `entity_id` with `targets`.
    pub fn replace(conn: &Connection, entity_id: &str, kind: &str, targets: &[String]) -> Result<()> {
        conn.execute(
            "DELETE FROM entity_references WHERE entity_id = ?1 AND kind = ?2",
            params![entity_id, kind],
        )
        .with_context(|| format!("failed to clear `{kind}` references of `{entity_id}`"))?;

        let mut stmt = conn
            .prepare(
                "INSERT OR IGNORE INTO entity_references (entity_id, target_id, kind) VALUES (?1, ?2, ?3)",
            )
            .context("failed to prepare reference insert")?;
        for target in targets {
            stmt.execute(params![entity_id, target, kind])
                .with_context(|| format!("failed to insert reference `{entity_id}` -> `{target}`"))?;
        }
        Ok(())
    }

    pub fn targets(conn: &Connection, entity_id: &str, kind: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT target_id FROM entity_references WHERE entity_id = ?1 AND kind = ?2 \
                 ORDER BY target_id ASC",
            )
            .context("failed to prepare reference query")?;
        let rows = stmt
            .query_map(params![entity_id, kind], |row| row.get(0))
            .with_context(|| format!("failed to query references of `{entity_id}`"))?;
        rows.collect::<std::result::Result<Vec<String>, _>>().context("failed to collect references")
    }

    /// Entities referencing `target_id`.
    pub fn sources(conn: &Connection, target_id: &str, kind: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT entity_id FROM entity_references WHERE target_id = ?1 AND kind = ?2 \
                 ORDER BY entity_id ASC",
            )
            .context("failed to prepare back-reference query")?;
        let rows = stmt
            .query_map(params![target_id, kind], |row| row.get(0))
            .with_context(|| format!("failed to query references to `{target_id}`"))?;
        rows.collect::<std::result::Result<Vec<String>, _>>().context("failed to collect back-references")
    }

    pub fn delete_for_entity(conn: &Connection, entity_id: &str) -> Result<usize> {
        conn.execute("DELETE FROM entity_references WHERE entity_id = ?1", params![entity_id])
            .with_context(|| format!("failed to delete references of `{entity_id}`"))
    }
}
