// FTS5 text index over entity names and document bodies.
//
// Lives in the same database as the entity tables so index rows are written
// in the same transaction as the entity change that produced them.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub name: String,
    pub snippet: String,
    pub rank: f64,
}

pub struct SearchStore;

impl SearchStore {
    /// Index or re-index an entity. FTS5 has no upsert, so delete then insert.
    pub fn upsert(conn: &Connection, id: &str, name: &str, text: &str) -> Result<()> {
        Self::remove(conn, id)?;
        if name.is_empty() && text.is_empty() {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO entity_texts (id, name, text) VALUES (?1, ?2, ?3)",
            params![id, name, text],
        )
        .with_context(|| format!("failed to index entity `{id}`"))?;
        Ok(())
    }

    pub fn remove(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM entity_texts WHERE id = ?1", params![id])
            .with_context(|| format!("failed to remove entity `{id}` from the text index"))?;
        Ok(())
    }

    /// Ranked full-text query. bm25 is negated so higher is better.
    pub fn search(conn: &Connection, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(vec![]);
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, name, snippet(entity_texts, 2, '<b>', '</b>', '...', 32), -rank \
                 FROM entity_texts \
                 WHERE entity_texts MATCH ?1 \
                 ORDER BY rank \
                 LIMIT ?2",
            )
            .context("failed to prepare search query")?;

        let hits = stmt
            .query_map(params![quote_terms(query), limit as i64], |row| {
                Ok(SearchHit { id: row.get(0)?, name: row.get(1)?, snippet: row.get(2)?, rank: row.get(3)? })
            })
            .context("failed to execute search query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to collect search results")?;

        Ok(hits)
    }
}

/// Quote each whitespace-separated term so user input never parses as FTS5 syntax.
fn quote_terms(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
