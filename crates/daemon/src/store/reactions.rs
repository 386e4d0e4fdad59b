// reactions, interactions and counters tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{parse_optional_timestamp, parse_timestamp};

pub const REACTION_COUNT: &str = "reaction_count";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub entity_id: String,
    pub collaborator_id: String,
    pub reaction: String,
    pub root_id: String,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

pub struct ReactionStore;

impl ReactionStore {
    pub fn get(
        conn: &Connection,
        entity_id: &str,
        collaborator_id: &str,
        reaction: &str,
    ) -> Result<Option<ReactionRow>> {
        conn.query_row(
            "SELECT entity_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at \
             FROM reactions WHERE entity_id = ?1 AND collaborator_id = ?2 AND reaction = ?3",
            params![entity_id, collaborator_id, reaction],
            row_to_reaction,
        )
        .optional()
        .with_context(|| format!("failed to read reaction `{reaction}` on `{entity_id}`"))
    }

    /// Add a local reaction, reviving a soft-deleted one. False if already active.
    pub fn insert_local(conn: &Connection, row: &ReactionRow) -> Result<bool> {
        let changed = conn
            .execute(
                "INSERT INTO reactions \
                 (entity_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL) \
                 ON CONFLICT(entity_id, collaborator_id, reaction) DO UPDATE SET \
                     created_at = excluded.created_at, deleted_at = NULL \
                 WHERE reactions.deleted_at IS NOT NULL",
                params![
                    row.entity_id,
                    row.collaborator_id,
                    row.reaction,
                    row.root_id,
                    row.revision,
                    row.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to add reaction `{}` on `{}`", row.reaction, row.entity_id))?;
        Ok(changed > 0)
    }

    pub fn soft_delete(
        conn: &Connection,
        entity_id: &str,
        collaborator_id: &str,
        reaction: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE reactions SET deleted_at = ?1 \
                 WHERE entity_id = ?2 AND collaborator_id = ?3 AND reaction = ?4 AND deleted_at IS NULL",
                params![now.to_rfc3339(), entity_id, collaborator_id, reaction],
            )
            .with_context(|| format!("failed to remove reaction `{reaction}` on `{entity_id}`"))?;
        Ok(changed > 0)
    }

    /// Clear a soft delete.
    pub fn restore(conn: &Connection, entity_id: &str, collaborator_id: &str, reaction: &str) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE reactions SET deleted_at = NULL \
                 WHERE entity_id = ?1 AND collaborator_id = ?2 AND reaction = ?3 AND deleted_at IS NOT NULL",
                params![entity_id, collaborator_id, reaction],
            )
            .with_context(|| format!("failed to restore reaction `{reaction}` on `{entity_id}`"))?;
        Ok(changed > 0)
    }

    pub fn remove(conn: &Connection, entity_id: &str, collaborator_id: &str, reaction: &str) -> Result<bool> {
        let changed = conn
            .execute(
                "DELETE FROM reactions WHERE entity_id = ?1 AND collaborator_id = ?2 AND reaction = ?3",
                params![entity_id, collaborator_id, reaction],
            )
            .with_context(|| format!("failed to drop reaction `{reaction}` on `{entity_id}`"))?;
        Ok(changed > 0)
    }

    /// Apply a server row. Only a strictly newer revision replaces the stored row.
    pub fn upsert_remote(conn: &Connection, row: &ReactionRow) -> Result<bool> {
        let changed = conn
            .execute(
                "INSERT INTO reactions \
                 (entity_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(entity_id, collaborator_id, reaction) DO UPDATE SET \
                     revision = excluded.revision, created_at = excluded.created_at, \
                     deleted_at = excluded.deleted_at \
                 WHERE excluded.revision > reactions.revision",
                params![
                    row.entity_id,
                    row.collaborator_id,
                    row.reaction,
                    row.root_id,
                    row.revision,
                    row.created_at.to_rfc3339(),
                    row.deleted_at.map(|ts| ts.to_rfc3339()),
                ],
            )
            .with_context(|| format!("failed to merge reaction `{}` on `{}`", row.reaction, row.entity_id))?;
        Ok(changed > 0)
    }

    pub fn list_active(conn: &Connection, entity_id: &str) -> Result<Vec<ReactionRow>> {
        let mut stmt = conn
            .prepare(
                "SELECT entity_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at \
                 FROM reactions WHERE entity_id = ?1 AND deleted_at IS NULL \
                 ORDER BY created_at ASC, collaborator_id ASC",
            )
            .context("failed to prepare reaction query")?;
        let rows = stmt
            .query_map(params![entity_id], row_to_reaction)
            .with_context(|| format!("failed to query reactions of `{entity_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect reactions")
    }

    /// Every row of an entity, soft-deleted ones included.
    pub fn list_for_entity(conn: &Connection, entity_id: &str) -> Result<Vec<ReactionRow>> {
        let mut stmt = conn
            .prepare(
                "SELECT entity_id, collaborator_id, reaction, root_id, revision, created_at, deleted_at \
                 FROM reactions WHERE entity_id = ?1 ORDER BY created_at ASC, collaborator_id ASC, reaction ASC",
            )
            .context("failed to prepare reaction query")?;
        let rows = stmt
            .query_map(params![entity_id], row_to_reaction)
            .with_context(|| format!("failed to query reactions of `{entity_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect reactions")
    }

    pub fn delete_for_entity(conn: &Connection, entity_id: &str) -> Result<usize> {
        conn.execute("DELETE FROM reactions WHERE entity_id = ?1", params![entity_id])
            .with_context(|| format!("failed to delete reactions of `{entity_id}`"))
    }

    /// Recompute the `reaction_count` counter from active rows.
    pub fn refresh_count(conn: &Connection, entity_id: &str) -> Result<i64> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reactions WHERE entity_id = ?1 AND deleted_at IS NULL",
                params![entity_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count reactions of `{entity_id}`"))?;
        CounterStore::set(conn, entity_id, REACTION_COUNT, count)?;
        Ok(count)
    }
}

fn row_to_reaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRow> {
    let created_at: String = row.get(5)?;
    Ok(ReactionRow {
        entity_id: row.get(0)?,
        collaborator_id: row.get(1)?,
        reaction: row.get(2)?,
        root_id: row.get(3)?,
        revision: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
        deleted_at: parse_optional_timestamp(6, row.get(6)?)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRow {
    pub entity_id: String,
    pub collaborator_id: String,
    pub root_id: String,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub revision: i64,
}

pub struct InteractionStore;

impl InteractionStore {
    pub fn get(conn: &Connection, entity_id: &str, collaborator_id: &str) -> Result<Option<InteractionRow>> {
        conn.query_row(
            "SELECT entity_id, collaborator_id, root_id, first_seen_at, last_seen_at, last_opened_at, revision \
             FROM interactions WHERE entity_id = ?1 AND collaborator_id = ?2",
            params![entity_id, collaborator_id],
            row_to_interaction,
        )
        .optional()
        .with_context(|| format!("failed to read interaction on `{entity_id}`"))
    }

    /// Apply a server row. Only a strictly newer revision replaces the stored row.
    pub fn upsert_remote(conn: &Connection, row: &InteractionRow) -> Result<bool> {
        let changed = conn
            .execute(
                "INSERT INTO interactions \
                 (entity_id, collaborator_id, root_id, first_seen_at, last_seen_at, last_opened_at, revision) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(entity_id, collaborator_id) DO UPDATE SET \
                     first_seen_at = excluded.first_seen_at, last_seen_at = excluded.last_seen_at, \
                     last_opened_at = excluded.last_opened_at, revision = excluded.revision \
                 WHERE excluded.revision > interactions.revision",
                params![
                    row.entity_id,
                    row.collaborator_id,
                    row.root_id,
                    row.first_seen_at.map(|ts| ts.to_rfc3339()),
                    row.last_seen_at.map(|ts| ts.to_rfc3339()),
                    row.last_opened_at.map(|ts| ts.to_rfc3339()),
                    row.revision,
                ],
            )
            .with_context(|| format!("failed to merge interaction on `{}`", row.entity_id))?;
        Ok(changed > 0)
    }

    pub fn list_for_entity(conn: &Connection, entity_id: &str) -> Result<Vec<InteractionRow>> {
        let mut stmt = conn
            .prepare(
                "SELECT entity_id, collaborator_id, root_id, first_seen_at, last_seen_at, last_opened_at, revision \
                 FROM interactions WHERE entity_id = ?1 ORDER BY collaborator_id ASC",
            )
            .context("failed to prepare interaction query")?;
        let rows = stmt
            .query_map(params![entity_id], row_to_interaction)
            .with_context(|| format!("failed to query interactions of `{entity_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect interactions")
    }

    pub fn delete_for_entity(conn: &Connection, entity_id: &str) -> Result<usize> {
        conn.execute("DELETE FROM interactions WHERE entity_id = ?1", params![entity_id])
            .with_context(|| format!("failed to delete interactions of `{entity_id}`"))
    }
}

fn row_to_interaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<InteractionRow> {
    Ok(InteractionRow {
        entity_id: row.get(0)?,
        collaborator_id: row.get(1)?,
        root_id: row.get(2)?,
        first_seen_at: parse_optional_timestamp(3, row.get(3)?)?,
        last_seen_at: parse_optional_timestamp(4, row.get(4)?)?,
        last_opened_at: parse_optional_timestamp(5, row.get(5)?)?,
        revision: row.get(6)?,
    })
}

pub struct CounterStore;

impl CounterStore {
    pub fn get(conn: &Connection, entity_id: &str, kind: &str) -> Result<i64> {
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM counters WHERE entity_id = ?1 AND kind = ?2",
                params![entity_id, kind],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read counter `{kind}` of `{entity_id}`"))?;
        Ok(value.unwrap_or(0))
    }

    pub fn set(conn: &Connection, entity_id: &str, kind: &str, value: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO counters (entity_id, kind, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(entity_id, kind) DO UPDATE SET value = excluded.value",
            params![entity_id, kind, value],
        )
        .with_context(|| format!("failed to write counter `{kind}` of `{entity_id}`"))?;
        Ok(())
    }

    pub fn delete_for_entity(conn: &Connection, entity_id: &str) -> Result<usize> {
        conn.execute("DELETE FROM counters WHERE entity_id = ?1", params![entity_id])
            .with_context(|| format!("failed to delete counters of `{entity_id}`"))
    }
}
