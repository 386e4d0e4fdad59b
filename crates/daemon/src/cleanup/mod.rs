// Deletion propagation and dependent-row cleanup.
//
// Every function here runs inside the caller's transaction. A deleted entity
// leaves a tombstone carrying its last-known row and merged replica state,
// which both suppresses stale re-creation and allows a rejected local delete
// to be undone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::acl::{self, CollaborationChange};
use crate::engine::Replica;
use crate::store::{
    CounterStore, DeltaLog, EntitiesStore, EntityRow, EntityState, FileStateStore, InteractionStore,
    ReactionStore, ReferenceStore, SearchStore, TombstoneOrigin, TombstoneRecord, TombstoneSnapshot,
    TombstoneStore,
};

/// What a deletion removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Deletion {
    pub tombstone: TombstoneRecord,
    /// Whether a live row existed before the deletion.
    pub had_row: bool,
    pub collaborations: Vec<CollaborationChange>,
}

/// Outcome of undoing a rejected local delete.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored(EntityRow),
    /// The tombstone is gone, remote, or belongs to a different deletion.
    Superseded,
    /// Something live already occupies the id.
    LiveRowExists,
}

/// Outcome of undoing a rejected local create.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Purge {
    pub row: Option<EntityRow>,
    pub upload_cancelled: bool,
    pub collaborations: Vec<CollaborationChange>,
}

/// Capture the row plus its state with every pending delta merged in.
pub fn snapshot(conn: &Connection, row: &EntityRow) -> Result<TombstoneSnapshot> {
    let state = DeltaLog::get_state(conn, &row.id)?;
    let deltas = DeltaLog::pending_for(conn, &row.id)?;
    let replica = Replica::from_parts(
        state.as_ref().map(|s| s.state.as_slice()),
        deltas.iter().map(|d| d.data.as_slice()),
    )
    .with_context(|| format!("failed to load replica of `{}` for its tombstone", row.id))?;
    Ok(TombstoneSnapshot {
        entity: row.clone(),
        state: replica.export_state(),
        state_revision: state.map_or(0, |s| s.revision),
        reactions: ReactionStore::list_for_entity(conn, &row.id)?,
        interactions: InteractionStore::list_for_entity(conn, &row.id)?,
    })
}

/// Remove every row derived from an entity. Collaborations are soft-deleted.
pub fn purge_derived(conn: &Connection, entity_id: &str, now: DateTime<Utc>) -> Result<Vec<CollaborationChange>> {
    let changes = acl::revoke_all(conn, entity_id, now)?;
    ReactionStore::delete_for_entity(conn, entity_id)?;
    InteractionStore::delete_for_entity(conn, entity_id)?;
    ReferenceStore::delete_for_entity(conn, entity_id)?;
    CounterStore::delete_for_entity(conn, entity_id)?;
    SearchStore::remove(conn, entity_id)?;
    FileStateStore::delete(conn, entity_id)?;
    Ok(changes)
}

fn remove_replica(conn: &Connection, entity_id: &str) -> Result<bool> {
    let had_row = EntitiesStore::delete(conn, entity_id)?;
    DeltaLog::delete_state(conn, entity_id)?;
    DeltaLog::remove_for_entity(conn, entity_id)?;
    Ok(had_row)
}

/// Delete a live entity on behalf of the local user.
pub fn delete_local(
    conn: &Connection,
    row: &EntityRow,
    deleted_by: &str,
    deleted_at: DateTime<Utc>,
) -> Result<Deletion> {
    let snapshot = snapshot(conn, row)?;
    let had_row = remove_replica(conn, &row.id)?;
    let collaborations = purge_derived(conn, &row.id, deleted_at)?;
    let tombstone = TombstoneRecord {
        id: row.id.clone(),
        root_id: row.root_id.clone(),
        snapshot: Some(snapshot),
        deleted_at,
        deleted_by: deleted_by.to_owned(),
        origin: TombstoneOrigin::Local,
        revision: None,
    };
    TombstoneStore::put(conn, &tombstone)?;
    debug!(entity_id = %row.id, "entity tombstoned locally");
    Ok(Deletion { tombstone, had_row, collaborations })
}

/// Apply a server deletion. Remote deletion always wins over local state,
/// including pending deltas. Returns `None` when a newer remote tombstone
/// is already recorded.
pub fn apply_remote_tombstone(
    conn: &Connection,
    entity_id: &str,
    root_id: &str,
    deleted_by: &str,
    deleted_at: DateTime<Utc>,
    revision: i64,
) -> Result<Option<Deletion>> {
    let existing = TombstoneStore::get(conn, entity_id)?;
    if let Some(existing) = &existing {
        if existing.origin == TombstoneOrigin::Remote && existing.revision.is_some_and(|r| r >= revision) {
            return Ok(None);
        }
    }

    let row = EntitiesStore::get(conn, entity_id)?;
    let snapshot = match &row {
        Some(row) => Some(snapshot(conn, row)?),
        None => existing.and_then(|tombstone| tombstone.snapshot),
    };
    let had_row = remove_replica(conn, entity_id)?;
    let collaborations = purge_derived(conn, entity_id, deleted_at)?;
    let tombstone = TombstoneRecord {
        id: entity_id.to_owned(),
        root_id: root_id.to_owned(),
        snapshot,
        deleted_at,
        deleted_by: deleted_by.to_owned(),
        origin: TombstoneOrigin::Remote,
        revision: Some(revision),
    };
    TombstoneStore::put(conn, &tombstone)?;
    info!(entity_id, revision, had_row, "remote tombstone applied");
    Ok(Some(Deletion { tombstone, had_row, collaborations }))
}

/// Undo a rejected local create: the entity goes back to nonexistent.
pub fn purge_created(conn: &Connection, entity_id: &str, now: DateTime<Utc>) -> Result<Purge> {
    let row = EntitiesStore::get(conn, entity_id)?;
    let upload_cancelled = FileStateStore::cancel_upload(conn, entity_id, now)?;
    remove_replica(conn, entity_id)?;
    let collaborations = purge_derived(conn, entity_id, now)?;
    Ok(Purge { row, upload_cancelled, collaborations })
}

/// Undo a rejected local delete, re-inserting the entity, its reactions and
/// its interactions from the tombstone.
///
/// Only the tombstone written by that delete (local, same `deleted_at`) may
/// be reverted, and only while no live row occupies the id. Rows the server
/// sent since then win over the snapshot when their revision is newer.
pub fn restore_from_tombstone(conn: &Connection, entity_id: &str, deleted_at: DateTime<Utc>) -> Result<RestoreOutcome> {
    let Some(tombstone) = TombstoneStore::get(conn, entity_id)? else {
        return Ok(RestoreOutcome::Superseded);
    };
    if tombstone.origin != TombstoneOrigin::Local || tombstone.deleted_at != deleted_at {
        return Ok(RestoreOutcome::Superseded);
    }
    if EntitiesStore::exists(conn, entity_id)? {
        return Ok(RestoreOutcome::LiveRowExists);
    }
    let Some(snapshot) = tombstone.snapshot else {
        return Ok(RestoreOutcome::Superseded);
    };

    EntitiesStore::insert(conn, &snapshot.entity)?;
    DeltaLog::put_state(
        conn,
        &EntityState { id: entity_id.to_owned(), state: snapshot.state, revision: snapshot.state_revision },
    )?;
    for reaction in &snapshot.reactions {
        ReactionStore::upsert_remote(conn, reaction)?;
    }
    for interaction in &snapshot.interactions {
        InteractionStore::upsert_remote(conn, interaction)?;
    }
    if !snapshot.reactions.is_empty() {
        ReactionStore::refresh_count(conn, entity_id)?;
    }
    TombstoneStore::delete(conn, entity_id)?;
    info!(entity_id, reactions = snapshot.reactions.len(), "rejected delete reverted from tombstone");
    Ok(RestoreOutcome::Restored(snapshot.entity))
}
