// Collaboration index: flattened access table derived from the collaborator
// maps embedded in entity attributes.
//
// Access checks read only this table. The nearest active grant on the
// root-to-node chain wins.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use loam_common::types::Role;
use rusqlite::Connection;
use tracing::debug;

use crate::store::{CollaborationStore, EntityRow};

/// One change applied to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationChange {
    pub entity_id: String,
    pub collaborator_id: String,
    /// New role, or `None` when revoked.
    pub role: Option<Role>,
}

/// Effective role of `user_id` over the last entity in `ancestors`.
pub fn resolve_role(conn: &Connection, user_id: &str, ancestors: &[EntityRow]) -> Result<Option<Role>> {
    for entity in ancestors.iter().rev() {
        if let Some(role) = CollaborationStore::active_role(conn, &entity.id, user_id)? {
            return Ok(Some(role));
        }
    }
    Ok(None)
}

/// Apply the difference between two collaborator maps to the index.
///
/// `None` on either side means the entity has no map (not yet created,
/// deleted, or a type without collaborators).
pub fn sync_collaborations(
    conn: &Connection,
    entity_id: &str,
    old: Option<&BTreeMap<String, Role>>,
    new: Option<&BTreeMap<String, Role>>,
    now: DateTime<Utc>,
) -> Result<Vec<CollaborationChange>> {
    let empty = BTreeMap::new();
    let old = old.unwrap_or(&empty);
    let new = new.unwrap_or(&empty);
    let mut changes = Vec::new();

    for (collaborator_id, role) in new {
        if old.get(collaborator_id) != Some(role) {
            CollaborationStore::upsert_local(conn, entity_id, collaborator_id, *role, now)?;
            changes.push(CollaborationChange {
                entity_id: entity_id.to_owned(),
                collaborator_id: collaborator_id.clone(),
                role: Some(*role),
            });
        }
    }
    for collaborator_id in old.keys().filter(|id| !new.contains_key(*id)) {
        if CollaborationStore::soft_delete(conn, entity_id, collaborator_id, now)? {
            changes.push(CollaborationChange {
                entity_id: entity_id.to_owned(),
                collaborator_id: collaborator_id.clone(),
                role: None,
            });
        }
    }

    if !changes.is_empty() {
        debug!(entity_id, changes = changes.len(), "collaboration index updated");
    }
    Ok(changes)
}

/// Revoke every grant on a deleted entity.
pub fn revoke_all(conn: &Connection, entity_id: &str, now: DateTime<Utc>) -> Result<Vec<CollaborationChange>> {
    let active: Vec<_> = CollaborationStore::list_for_entity(conn, entity_id)?
        .into_iter()
        .filter(|row| row.is_active())
        .collect();
    CollaborationStore::soft_delete_all(conn, entity_id, now)?;
    Ok(active
        .into_iter()
        .map(|row| CollaborationChange { entity_id: row.entity_id, collaborator_id: row.collaborator_id, role: None })
        .collect())
}
