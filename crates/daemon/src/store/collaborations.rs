// collaborations table: the flattened access index.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use loam_common::types::Role;
use rusqlite::{params, Connection, OptionalExtension};

use super::{invalid_value, parse_optional_timestamp, parse_timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationRow {
    pub entity_id: String,
    pub collaborator_id: String,
    pub role: Role,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CollaborationRow {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

const COLUMNS: &str = "entity_id, collaborator_id, role, revision, created_at, updated_at, deleted_at";

pub struct CollaborationStore;

impl CollaborationStore {
    pub fn get(conn: &Connection, entity_id: &str, collaborator_id: &str) -> Result<Option<CollaborationRow>> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM collaborations WHERE entity_id = ?1 AND collaborator_id = ?2"),
            params![entity_id, collaborator_id],
            row_to_collaboration,
        )
        .optional()
        .with_context(|| format!("failed to read collaboration `{entity_id}`/`{collaborator_id}`"))
    }

    /// All rows for an entity, soft-deleted ones included.
    pub fn list_for_entity(conn: &Connection, entity_id: &str) -> Result<Vec<CollaborationRow>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM collaborations WHERE entity_id = ?1 ORDER BY collaborator_id ASC"
            ))
            .context("failed to prepare collaboration query")?;
        let rows = stmt
            .query_map(params![entity_id], row_to_collaboration)
            .with_context(|| format!("failed to query collaborations of `{entity_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect collaborations")
    }

    /// Active role of a collaborator on exactly this entity.
    pub fn active_role(conn: &Connection, entity_id: &str, collaborator_id: &str) -> Result<Option<Role>> {
        Ok(Self::get(conn, entity_id, collaborator_id)?.filter(CollaborationRow::is_active).map(|row| row.role))
    }

    /// Grant or change a role derived from local state. Revives soft-deleted rows.
    pub fn upsert_local(
        conn: &Connection,
        entity_id: &str,
        collaborator_id: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO collaborations (entity_id, collaborator_id, role, revision, created_at) \
             VALUES (?1, ?2, ?3, 0, ?4) \
             ON CONFLICT(entity_id, collaborator_id) DO UPDATE SET \
                 role = excluded.role, updated_at = excluded.created_at, deleted_at = NULL",
            params![entity_id, collaborator_id, role.as_str(), now.to_rfc3339()],
        )
        .with_context(|| format!("failed to upsert collaboration `{entity_id}`/`{collaborator_id}`"))?;
        Ok(())
    }

    pub fn soft_delete(conn: &Connection, entity_id: &str, collaborator_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE collaborations SET deleted_at = ?1, updated_at = ?1 \
                 WHERE entity_id = ?2 AND collaborator_id = ?3 AND deleted_at IS NULL",
                params![now.to_rfc3339(), entity_id, collaborator_id],
            )
            .with_context(|| format!("failed to revoke collaboration `{entity_id}`/`{collaborator_id}`"))?;
        Ok(changed > 0)
    }

    pub fn soft_delete_all(conn: &Connection, entity_id: &str, now: DateTime<Utc>) -> Result<usize> {
        conn.execute(
            "UPDATE collaborations SET deleted_at = ?1, updated_at = ?1 \
             WHERE entity_id = ?2 AND deleted_at IS NULL",
            params![now.to_rfc3339(), entity_id],
        )
        .with_context(|| format!("failed to revoke collaborations of `{entity_id}`"))
    }

    /// Apply a server row. Only a strictly newer revision replaces the stored row.
    pub fn upsert_remote(conn: &Connection, row: &CollaborationRow) -> Result<bool> {
        let changed = conn
            .execute(
                "INSERT INTO collaborations \
                 (entity_id, collaborator_id, role, revision, created_at, updated_at, deleted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(entity_id, collaborator_id) DO UPDATE SET \
                     role = excluded.role, revision = excluded.revision, \
                     updated_at = excluded.updated_at, deleted_at = excluded.deleted_at \
                 WHERE excluded.revision > collaborations.revision",
                params![
                    row.entity_id,
                    row.collaborator_id,
                    row.role.as_str(),
                    row.revision,
                    row.created_at.to_rfc3339(),
                    row.updated_at.map(|ts| ts.to_rfc3339()),
                    row.deleted_at.map(|ts| ts.to_rfc3339()),
                ],
            )
            .with_context(|| {
                format!("failed to merge collaboration `{}`/`{}`", row.entity_id, row.collaborator_id)
            })?;
        Ok(changed > 0)
    }
}

fn row_to_collaboration(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollaborationRow> {
    let role: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    Ok(CollaborationRow {
        entity_id: row.get(0)?,
        collaborator_id: row.get(1)?,
        role: Role::parse(&role).ok_or_else(|| invalid_value(2, "role", &role))?,
        revision: row.get(3)?,
        created_at: parse_timestamp(4, &created_at)?,
        updated_at: parse_optional_timestamp(5, row.get(5)?)?,
        deleted_at: parse_optional_timestamp(6, row.get(6)?)?,
    })
}
