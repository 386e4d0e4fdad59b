// entity_states + entity_deltas: compacted state and the pending local log.
//
// An entity's replica is always `state` followed by its pending deltas in
// `seq` order. Acknowledged deltas are folded into `state` and removed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_timestamp, parse_uuid};

/// Compacted CRDT state of everything acknowledged or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    pub id: String,
    pub state: Vec<u8>,
    /// Highest server revision merged into `state`.
    pub revision: i64,
}

/// A local delta not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelta {
    pub seq: i64,
    pub delta_id: Uuid,
    pub entity_id: String,
    pub root_id: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub mutation_id: Uuid,
}

pub struct DeltaLog;

impl DeltaLog {
    pub fn get_state(conn: &Connection, id: &str) -> Result<Option<EntityState>> {
        conn.query_row(
            "SELECT id, state, revision FROM entity_states WHERE id = ?1",
            params![id],
            |row| Ok(EntityState { id: row.get(0)?, state: row.get(1)?, revision: row.get(2)? }),
        )
        .optional()
        .with_context(|| format!("failed to read state of entity `{id}`"))
    }

    pub fn put_state(conn: &Connection, state: &EntityState) -> Result<()> {
        conn.execute(
            "INSERT INTO entity_states (id, state, revision) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, \
                 revision = MAX(entity_states.revision, excluded.revision)",
            params![state.id, state.state, state.revision],
        )
        .with_context(|| format!("failed to write state of entity `{}`", state.id))?;
        Ok(())
    }

    pub fn delete_state(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM entity_states WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete state of entity `{id}`"))?;
        Ok(())
    }

    /// Append a pending delta. `seq` on the input is ignored; returns the assigned one.
    pub fn append(conn: &Connection, delta: &PendingDelta) -> Result<i64> {
        conn.execute(
            "INSERT INTO entity_deltas \
             (delta_id, entity_id, root_id, data, created_at, created_by, mutation_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                delta.delta_id.to_string(),
                delta.entity_id,
                delta.root_id,
                delta.data,
                delta.created_at.to_rfc3339(),
                delta.created_by,
                delta.mutation_id.to_string(),
            ],
        )
        .with_context(|| format!("failed to append delta for entity `{}`", delta.entity_id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending deltas of one entity in replay order.
    pub fn pending_for(conn: &Connection, entity_id: &str) -> Result<Vec<PendingDelta>> {
        let mut stmt = conn
            .prepare(
                "SELECT seq, delta_id, entity_id, root_id, data, created_at, created_by, mutation_id \
                 FROM entity_deltas WHERE entity_id = ?1 ORDER BY seq ASC",
            )
            .context("failed to prepare pending delta query")?;
        let rows = stmt
            .query_map(params![entity_id], row_to_delta)
            .with_context(|| format!("failed to query pending deltas of `{entity_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect pending deltas")
    }

    pub fn get(conn: &Connection, delta_id: Uuid) -> Result<Option<PendingDelta>> {
        conn.query_row(
            "SELECT seq, delta_id, entity_id, root_id, data, created_at, created_by, mutation_id \
             FROM entity_deltas WHERE delta_id = ?1",
            params![delta_id.to_string()],
            row_to_delta,
        )
        .optional()
        .with_context(|| format!("failed to read delta `{delta_id}`"))
    }

    pub fn remove(conn: &Connection, delta_id: Uuid) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM entity_deltas WHERE delta_id = ?1", params![delta_id.to_string()])
            .with_context(|| format!("failed to remove delta `{delta_id}`"))?;
        Ok(changed > 0)
    }

    pub fn remove_for_entity(conn: &Connection, entity_id: &str) -> Result<usize> {
        conn.execute("DELETE FROM entity_deltas WHERE entity_id = ?1", params![entity_id])
            .with_context(|| format!("failed to remove deltas of entity `{entity_id}`"))
    }
}

fn row_to_delta(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingDelta> {
    let delta_id: String = row.get(1)?;
    let created_at: String = row.get(5)?;
    let mutation_id: String = row.get(7)?;
    Ok(PendingDelta {
        seq: row.get(0)?,
        delta_id: parse_uuid(1, &delta_id)?,
        entity_id: row.get(2)?,
        root_id: row.get(3)?,
        data: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
        created_by: row.get(6)?,
        mutation_id: parse_uuid(7, &mutation_id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaDb;

    fn delta(entity_id: &str, data: &[u8]) -> PendingDelta {
        PendingDelta {
            seq: 0,
            delta_id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            root_id: "space-1".into(),
            data: data.to_vec(),
            created_at: Utc::now(),
            created_by: "user-1".into(),
            mutation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn pending_deltas_replay_in_append_order() {
        let db = MetaDb::open_in_memory().expect("db");
        let first = delta("page-1", b"a");
        let second = delta("page-1", b"b");
        let first_seq = DeltaLog::append(db.connection(), &first).expect("append");
        let second_seq = DeltaLog::append(db.connection(), &second).expect("append");
        DeltaLog::append(db.connection(), &delta("page-2", b"c")).expect("append other");
        assert!(second_seq > first_seq);

        let pending = DeltaLog::pending_for(db.connection(), "page-1").expect("pending");
        assert_eq!(pending.iter().map(|d| d.delta_id).collect::<Vec<_>>(), vec![first.delta_id, second.delta_id]);

        assert!(DeltaLog::remove(db.connection(), first.delta_id).expect("remove"));
        assert!(!DeltaLog::remove(db.connection(), first.delta_id).expect("remove again"));
        assert_eq!(DeltaLog::pending_for(db.connection(), "page-1").expect("pending").len(), 1);
    }

    #[test]
    fn state_revision_only_moves_forward() {
        let db = MetaDb::open_in_memory().expect("db");
        let conn = db.connection();
        DeltaLog::put_state(conn, &EntityState { id: "page-1".into(), state: vec![1], revision: 8 })
            .expect("put");
        DeltaLog::put_state(conn, &EntityState { id: "page-1".into(), state: vec![2], revision: 3 })
            .expect("put");

        let state = DeltaLog::get_state(conn, "page-1").expect("get").expect("exists");
        assert_eq!(state.state, vec![2]);
        assert_eq!(state.revision, 8);
    }
}
