// tombstones table: retained records of deleted entities.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::entities::EntityRow;
use super::reactions::{InteractionRow, ReactionRow};
use super::{invalid_value, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneOrigin {
    Local,
    Remote,
}

impl TombstoneOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Last-known contents of a deleted entity, enough to re-insert it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TombstoneSnapshot {
    pub entity: EntityRow,
    /// Compacted state with pending deltas merged in.
    #[serde(serialize_with = "encode_b64", deserialize_with = "decode_b64")]
    pub state: Vec<u8>,
    pub state_revision: i64,
    /// Reaction and interaction rows removed with the entity.
    #[serde(default)]
    pub reactions: Vec<ReactionRow>,
    #[serde(default)]
    pub interactions: Vec<InteractionRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TombstoneRecord {
    pub id: String,
    pub root_id: String,
    /// Absent for remote deletions of entities never seen locally.
    pub snapshot: Option<TombstoneSnapshot>,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    pub origin: TombstoneOrigin,
    /// Server revision of a remote tombstone.
    pub revision: Option<i64>,
}

pub struct TombstoneStore;

impl TombstoneStore {
    /// Insert or overwrite the tombstone for `record.id`.
    pub fn put(conn: &Connection, record: &TombstoneRecord) -> Result<()> {
        let data = serde_json::to_string(&record.snapshot).context("failed to encode tombstone snapshot")?;
        conn.execute(
            "INSERT OR REPLACE INTO tombstones \
             (id, root_id, data, deleted_at, deleted_by, origin, revision) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.root_id,
                data,
                record.deleted_at.to_rfc3339(),
                record.deleted_by,
                record.origin.as_str(),
                record.revision,
            ],
        )
        .with_context(|| format!("failed to write tombstone `{}`", record.id))?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<TombstoneRecord>> {
        conn.query_row(
            "SELECT id, root_id, data, deleted_at, deleted_by, origin, revision \
             FROM tombstones WHERE id = ?1",
            params![id],
            row_to_tombstone,
        )
        .optional()
        .with_context(|| format!("failed to read tombstone `{id}`"))
    }

    pub fn exists(conn: &Connection, id: &str) -> Result<bool> {
        let count: i64 = conn
            .query_row("SELECT COUNT(1) FROM tombstones WHERE id = ?1", params![id], |row| row.get(0))
            .with_context(|| format!("failed to check tombstone `{id}`"))?;
        Ok(count > 0)
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM tombstones WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete tombstone `{id}`"))?;
        Ok(changed > 0)
    }
}

fn row_to_tombstone(row: &rusqlite::Row<'_>) -> rusqlite::Result<TombstoneRecord> {
    let data: String = row.get(2)?;
    let deleted_at: String = row.get(3)?;
    let origin: String = row.get(5)?;
    let snapshot = serde_json::from_str(&data).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(error))
    })?;
    Ok(TombstoneRecord {
        id: row.get(0)?,
        root_id: row.get(1)?,
        snapshot,
        deleted_at: parse_timestamp(3, &deleted_at)?,
        deleted_by: row.get(4)?,
        origin: TombstoneOrigin::parse(&origin).ok_or_else(|| invalid_value(5, "tombstone origin", &origin))?,
        revision: row.get(6)?,
    })
}

fn encode_b64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn decode_b64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64.decode(encoded).map_err(serde::de::Error::custom)
}
