// Derived rows and replica plumbing shared by local writes, inbound merges
// and outbox reverts. All functions run inside the caller's transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use uuid::Uuid;

use crate::acl::{self, CollaborationChange};
use crate::engine::Replica;
use crate::model::{EntityModel, ModelRegistry};
use crate::store::references::MENTION;
use crate::store::{DeltaLog, EntitiesStore, EntityRow, EntityState, PendingDelta, ReferenceStore, SearchStore};

/// An entity's replica together with the rows it was built from.
pub struct LoadedReplica {
    pub replica: Replica,
    pub state: Option<EntityState>,
    pub pending: Vec<PendingDelta>,
}

/// Compacted state followed by pending deltas in sequence order.
pub fn load_replica(conn: &Connection, entity_id: &str) -> Result<LoadedReplica> {
    let state = DeltaLog::get_state(conn, entity_id)?;
    let pending = DeltaLog::pending_for(conn, entity_id)?;
    let replica = Replica::from_parts(
        state.as_ref().map(|s| s.state.as_slice()),
        pending.iter().map(|d| d.data.as_slice()),
    )
    .with_context(|| format!("failed to load replica of `{entity_id}`"))?;
    Ok(LoadedReplica { replica, state, pending })
}

/// Rewrite search text, mentions and collaborations for `attributes`.
///
/// `previous` is the attribute object before the change, `None` for a
/// freshly created entity.
pub fn refresh_derived(
    conn: &Connection,
    model: &dyn EntityModel,
    entity_id: &str,
    previous: Option<&Value>,
    attributes: &Value,
    now: DateTime<Utc>,
) -> Result<Vec<CollaborationChange>> {
    let text = model.extract_text(attributes);
    SearchStore::upsert(conn, entity_id, &text.name, &text.text)?;
    ReferenceStore::replace(conn, entity_id, MENTION, &model.extract_mentions(attributes))?;

    let old = previous.and_then(|previous| model.collaborators(previous));
    let new = model.collaborators(attributes);
    acl::sync_collaborations(conn, entity_id, old.as_ref(), new.as_ref(), now)
}

/// Result of recomputing an entity from its replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Rematerialized {
    pub row: EntityRow,
    pub changed: bool,
    pub collaborations: Vec<CollaborationChange>,
}

/// Recompute attributes from state plus remaining pending deltas and store
/// them with refreshed derived rows. `local_revision` is left untouched.
/// Returns `None` when the entity has no live row.
pub fn rematerialize(
    conn: &Connection,
    registry: &ModelRegistry,
    entity_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Rematerialized>> {
    let Some(mut row) = EntitiesStore::get(conn, entity_id)? else {
        return Ok(None);
    };
    let model = registry.get(&row.entity_type).map_err(anyhow::Error::from)?;
    let loaded = load_replica(conn, entity_id)?;
    let attributes = loaded
        .replica
        .materialize(model.schema())
        .with_context(|| format!("failed to materialize `{entity_id}`"))?;
    if attributes == row.attributes {
        return Ok(Some(Rematerialized { row, changed: false, collaborations: Vec::new() }));
    }

    let parent_id = parent_of(&attributes).or(row.parent_id.clone());
    EntitiesStore::replace_attributes(conn, entity_id, &attributes, parent_id.as_deref())?;
    let collaborations = refresh_derived(conn, model.as_ref(), entity_id, Some(&row.attributes), &attributes, now)?;
    row.attributes = attributes;
    row.parent_id = parent_id;
    Ok(Some(Rematerialized { row, changed: true, collaborations }))
}

/// Fold an acknowledged delta into the compacted state. Attributes do not
/// change: the delta was already part of the materialized view.
pub fn fold_delta(conn: &Connection, delta_id: Uuid) -> Result<bool> {
    let Some(delta) = DeltaLog::get(conn, delta_id)? else {
        return Ok(false);
    };
    let state = DeltaLog::get_state(conn, &delta.entity_id)?;
    let replica = Replica::from_state(state.as_ref().map_or(&[][..], |s| s.state.as_slice()))
        .with_context(|| format!("failed to load state of `{}`", delta.entity_id))?;
    replica.apply_delta(&delta.data).with_context(|| format!("failed to fold delta `{delta_id}`"))?;
    DeltaLog::put_state(
        conn,
        &EntityState {
            id: delta.entity_id.clone(),
            state: replica.export_state(),
            revision: state.map_or(0, |s| s.revision),
        },
    )?;
    DeltaLog::remove(conn, delta_id)
}

pub fn parent_of(attributes: &Value) -> Option<String> {
    attributes.get("parent_id").and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PageModel;
    use crate::store::MetaDb;
    use serde_json::json;

    fn page_row(attributes: Value) -> EntityRow {
        EntityRow {
            id: "page-1".into(),
            entity_type: "page".into(),
            parent_id: Some("space-1".into()),
            root_id: "space-1".into(),
            attributes,
            local_revision: 1,
            server_revision: 0,
            created_at: Utc::now(),
            created_by: "user-1".into(),
            updated_at: None,
            updated_by: None,
        }
    }

    fn append(conn: &Connection, data: Vec<u8>) -> Uuid {
        let delta_id = Uuid::new_v4();
        DeltaLog::append(
            conn,
            &PendingDelta {
                seq: 0,
                delta_id,
                entity_id: "page-1".into(),
                root_id: "space-1".into(),
                data,
                created_at: Utc::now(),
                created_by: "user-1".into(),
                mutation_id: Uuid::new_v4(),
            },
        )
        .expect("append");
        delta_id
    }

    #[test]
    fn fold_moves_delta_into_state_without_changing_view() {
        let db = MetaDb::open_in_memory().expect("db");
        let conn = db.connection();
        let model = PageModel;
        let attributes = json!({ "type": "page", "parent_id": "space-1", "name": "Plan" });
        let replica = Replica::new();
        let delta = replica.compute_delta(model.schema(), &attributes).expect("delta").expect("changed");
        EntitiesStore::insert(conn, &page_row(attributes.clone())).expect("insert");
        let delta_id = append(conn, delta);

        assert!(fold_delta(conn, delta_id).expect("fold"));
        assert!(!fold_delta(conn, delta_id).expect("second fold"));

        let loaded = load_replica(conn, "page-1").expect("load");
        assert!(loaded.pending.is_empty());
        assert_eq!(loaded.replica.materialize(model.schema()).expect("view"), attributes);
    }

    #[test]
    fn dropping_a_delta_and_rematerializing_reverts_the_view() {
        let db = MetaDb::open_in_memory().expect("db");
        let conn = db.connection();
        let registry = ModelRegistry::standard();
        let model = PageModel;
        let created = json!({ "type": "page", "parent_id": "space-1", "name": "Plan" });
        let renamed = json!({ "type": "page", "parent_id": "space-1", "name": "Roadmap", "body": "@[user-2]" });

        let replica = Replica::new();
        let first = replica.compute_delta(model.schema(), &created).expect("delta").expect("changed");
        let second = replica.compute_delta(model.schema(), &renamed).expect("delta").expect("changed");
        EntitiesStore::insert(conn, &page_row(renamed.clone())).expect("insert");
        append(conn, first);
        let faulty = append(conn, second);
        refresh_derived(conn, &model, "page-1", None, &renamed, Utc::now()).expect("derived");
        assert_eq!(ReferenceStore::targets(conn, "page-1", MENTION).expect("refs"), vec!["user-2"]);

        DeltaLog::remove(conn, faulty).expect("remove");
        let outcome = rematerialize(conn, &registry, "page-1", Utc::now()).expect("recompute").expect("row");
        assert!(outcome.changed);
        assert_eq!(outcome.row.attributes, created);
        assert_eq!(EntitiesStore::get(conn, "page-1").expect("get").expect("row").local_revision, 1);
        assert!(ReferenceStore::targets(conn, "page-1", MENTION).expect("refs").is_empty());
    }
}
