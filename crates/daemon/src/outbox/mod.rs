// Mutation outbox: durable queue of local intents awaiting acknowledgement.
//
// Records move through a small state machine:
//   pending → (acked | reverted)         row deleted
//   pending → pending                    transport failure, retry_count + 1
//   pending → failed                     retry ceiling reached, kept for inspection
//
// Enqueue always runs inside the transaction of the local write it records.

pub mod processor;
mod revert;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use loam_common::protocol::mutations::{Mutation, MutationData, MutationKind};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::store::{invalid_value, parse_timestamp, parse_uuid};

pub use processor::{DrainReport, OutboxProcessor, OutboxSettings};

/// Record lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Failed,
}

impl MutationState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A queued mutation as stored locally.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub seq: i64,
    pub id: Uuid,
    pub kind: MutationKind,
    pub entity_id: String,
    pub data: MutationData,
    pub retry_count: u32,
    pub state: MutationState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MutationRecord {
    /// Wire form submitted to the central service.
    pub fn to_mutation(&self) -> Mutation {
        Mutation { id: self.id, created_at: self.created_at, data: self.data.clone() }
    }
}

/// Outbox queue backed by the `mutations` table.
pub struct MutationQueue<'a> {
    conn: &'a Connection,
}

impl<'a> MutationQueue<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a mutation. Returns its sequence number.
    pub fn enqueue(&self, mutation: &Mutation) -> Result<i64> {
        let data = serde_json::to_string(&mutation.data).context("failed to encode mutation payload")?;
        self.conn
            .execute(
                "INSERT INTO mutations (id, type, entity_id, data, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    mutation.id.to_string(),
                    mutation.data.kind().as_str(),
                    mutation.data.entity_id(),
                    data,
                    MutationState::Pending.as_str(),
                    mutation.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to enqueue mutation `{}`", mutation.id))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest pending mutations first.
    pub fn pending_batch(&self, limit: u32) -> Result<Vec<MutationRecord>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM mutations WHERE status = ?1 ORDER BY seq ASC LIMIT ?2"),
            params![MutationState::Pending.as_str(), limit],
        )
    }

    pub fn list_failed(&self) -> Result<Vec<MutationRecord>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM mutations WHERE status = ?1 ORDER BY seq ASC"),
            params![MutationState::Failed.as_str()],
        )
    }

    pub fn list_for_entity(&self, entity_id: &str) -> Result<Vec<MutationRecord>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM mutations WHERE entity_id = ?1 ORDER BY seq ASC"),
            params![entity_id],
        )
    }

    pub fn get(&self, id: Uuid) -> Result<Option<MutationRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM mutations WHERE id = ?1"),
                params![id.to_string()],
                row_to_record,
            )
            .optional()
            .with_context(|| format!("failed to read mutation `{id}`"))
    }

    /// Drop a record once it was acknowledged or reverted.
    pub fn remove(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM mutations WHERE id = ?1", params![id.to_string()])
            .with_context(|| format!("failed to remove mutation `{id}`"))?;
        Ok(rows > 0)
    }

    /// Count a transport failure. At `max_retries` the record becomes
    /// `failed` and is no longer drained. Returns the resulting state.
    pub fn record_failure(&self, id: Uuid, error: &str, max_retries: u32) -> Result<Option<MutationState>> {
        let Some(record) = self.get(id)? else {
            return Ok(None);
        };
        if record.state == MutationState::Failed {
            return Ok(Some(MutationState::Failed));
        }

        let retry_count = record.retry_count.saturating_add(1);
        let state = if retry_count >= max_retries { MutationState::Failed } else { MutationState::Pending };
        self.conn
            .execute(
                "UPDATE mutations SET retry_count = ?1, status = ?2, last_error = ?3 WHERE id = ?4",
                params![retry_count, state.as_str(), error, id.to_string()],
            )
            .with_context(|| format!("failed to record failure of mutation `{id}`"))?;
        Ok(Some(state))
    }

    pub fn count_pending(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM mutations WHERE status = ?1",
                params![MutationState::Pending.as_str()],
                |row| row.get(0),
            )
            .context("failed to count pending mutations")
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<MutationRecord>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare mutation query")?;
        let rows = stmt.query_map(params, row_to_record).context("failed to query mutations")?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect mutations")
    }
}

const COLUMNS: &str = "seq, id, type, entity_id, data, retry_count, status, last_error, created_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationRecord> {
    let id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let data: String = row.get(4)?;
    let state: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(MutationRecord {
        seq: row.get(0)?,
        id: parse_uuid(1, &id)?,
        kind: MutationKind::parse(&kind).ok_or_else(|| invalid_value(2, "mutation type", &kind))?,
        entity_id: row.get(3)?,
        data: serde_json::from_str(&data).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(error))
        })?,
        retry_count: row.get(5)?,
        state: MutationState::parse(&state).ok_or_else(|| invalid_value(6, "mutation status", &state))?,
        last_error: row.get(7)?,
        created_at: parse_timestamp(8, &created_at)?,
    })
}
