// Undo the local effect of a mutation the central service rejected.

use anyhow::Result;
use chrono::{DateTime, Utc};
use loam_common::protocol::mutations::MutationData;
use rusqlite::Connection;
use tracing::{info, warn};

use super::MutationRecord;
use crate::cleanup::{self, RestoreOutcome};
use crate::entity::collaboration_event;
use crate::entity::derived::{refresh_derived, rematerialize};
use crate::events::EngineEvent;
use crate::model::ModelRegistry;
use crate::store::{DeltaLog, EntitiesStore, ReactionStore};

/// Apply the type-specific revert inside the caller's transaction and
/// return the events to publish after commit.
pub(super) fn revert(
    conn: &Connection,
    registry: &ModelRegistry,
    record: &MutationRecord,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<EngineEvent>> {
    let mut events = Vec::new();
    match &record.data {
        MutationData::CreateEntity { entity_id, root_id, .. } => {
            let purge = cleanup::purge_created(conn, entity_id, now)?;
            if purge.upload_cancelled {
                info!(entity_id, "pending upload cancelled by rejected create");
            }
            if purge.row.is_some() {
                events.push(EngineEvent::EntityDeleted { entity_id: entity_id.clone(), root_id: root_id.clone() });
            }
            events.extend(purge.collaborations.into_iter().map(collaboration_event));
        }
        MutationData::UpdateEntity { entity_id, delta_id, .. } => {
            DeltaLog::remove(conn, *delta_id)?;
            if let Some(outcome) = rematerialize(conn, registry, entity_id, now)? {
                if outcome.changed {
                    events.push(EngineEvent::EntityUpdated {
                        entity_id: entity_id.clone(),
                        root_id: outcome.row.root_id.clone(),
                        local_revision: outcome.row.local_revision,
                    });
                }
                events.extend(outcome.collaborations.into_iter().map(collaboration_event));
            }
        }
        MutationData::DeleteEntity { entity_id, root_id, deleted_at } => {
            match cleanup::restore_from_tombstone(conn, entity_id, *deleted_at)? {
                RestoreOutcome::Restored(row) => {
                    let model = registry.get(&row.entity_type).map_err(anyhow::Error::from)?;
                    let changes = refresh_derived(conn, model.as_ref(), entity_id, None, &row.attributes, now)?;
                    events.push(EngineEvent::EntityCreated { entity_id: entity_id.clone(), root_id: root_id.clone() });
                    events.extend(changes.into_iter().map(collaboration_event));
                }
                outcome => {
                    warn!(entity_id, ?outcome, "revert of rejected delete aborted");
                }
            }
        }
        MutationData::CreateReaction { entity_id, reaction, .. } => {
            ReactionStore::remove(conn, entity_id, user_id, reaction)?;
            events.extend(refresh_reactions(conn, entity_id, reaction)?);
        }
        MutationData::DeleteReaction { entity_id, reaction, .. } => {
            ReactionStore::restore(conn, entity_id, user_id, reaction)?;
            events.extend(refresh_reactions(conn, entity_id, reaction)?);
        }
    }
    events.push(EngineEvent::MutationReverted { mutation_id: record.id, entity_id: record.entity_id.clone() });
    Ok(events)
}

fn refresh_reactions(conn: &Connection, entity_id: &str, reaction: &str) -> Result<Option<EngineEvent>> {
    if !EntitiesStore::exists(conn, entity_id)? {
        return Ok(None);
    }
    let count = ReactionStore::refresh_count(conn, entity_id)?;
    Ok(Some(EngineEvent::ReactionChanged { entity_id: entity_id.to_owned(), reaction: reaction.to_owned(), count }))
}
