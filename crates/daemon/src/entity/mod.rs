// Entity store: the local persisted replica behind the public write API.
//
// Every committed write touches the entity row, its pending delta log, the
// derived rows and the outbox in one SQLite transaction. Concurrent updaters
// are resolved by compare-and-swap on `local_revision` plus bounded retry;
// the database mutex is held for one transaction at a time and never across
// an await.

pub mod derived;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use loam_common::protocol::mutations::{Mutation, MutationData};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acl::{self, CollaborationChange};
use crate::cleanup;
use crate::engine::Replica;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventPublisher};
use crate::model::{AuthContext, EntityModel, ModelRegistry};
use crate::outbox::MutationQueue;
use crate::retry::RetryPolicy;
use crate::scheduler::Trigger;
use crate::store::{
    self, DeltaLog, EntitiesStore, EntityRow, FileState, FileStateStore, PendingDelta, ReactionRow,
    ReactionStore, SearchHit, SearchStore, SharedDb, TombstoneRecord, TombstoneStore,
};

use derived::{load_replica, parent_of, refresh_derived};

/// Input of [`EntityStore::create_entity`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Full attribute object, including `type` (and `parent_id` for non-root types).
    pub attributes: Value,
}

impl NewEntity {
    pub fn new(attributes: Value) -> Self {
        Self { id: None, attributes }
    }

    pub fn with_id(id: impl Into<String>, attributes: Value) -> Self {
        Self { id: Some(id.into()), attributes }
    }
}

/// Result of [`EntityStore::update_entity`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(EntityRow),
    /// The updater produced no change; nothing was written.
    Unchanged(EntityRow),
}

impl UpdateOutcome {
    pub fn row(&self) -> &EntityRow {
        match self {
            Self::Updated(row) | Self::Unchanged(row) => row,
        }
    }
}

/// An update computed against one read of the entity.
#[derive(Debug, Clone)]
pub struct PreparedUpdate {
    /// The row as read; its `local_revision` guards the commit.
    pub entity: EntityRow,
    pub previous: Value,
    /// The view after the updater ran. The commit re-derives it from the log.
    pub attributes: Value,
    pub delta: Option<Vec<u8>>,
}

/// Result of one commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(EntityRow),
    NoOp(EntityRow),
    /// Another writer advanced `local_revision` first.
    Retry,
}

#[derive(Clone)]
pub struct EntityStore {
    db: SharedDb,
    registry: Arc<ModelRegistry>,
    events: EventPublisher,
    retry: RetryPolicy,
    user_id: String,
    outbox_trigger: Option<Trigger>,
}

impl EntityStore {
    pub fn new(
        db: SharedDb,
        registry: Arc<ModelRegistry>,
        events: EventPublisher,
        user_id: impl Into<String>,
    ) -> Self {
        Self { db, registry, events, retry: RetryPolicy::default(), user_id: user_id.into(), outbox_trigger: None }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Wake the outbox loop after every committed write.
    pub fn with_outbox_trigger(mut self, trigger: Trigger) -> Self {
        self.outbox_trigger = Some(trigger);
        self
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // ── Writes ──────────────────────────────────────────────────────

    pub fn create_entity(&self, input: NewEntity) -> EngineResult<EntityRow> {
        let model = self.registry.for_attributes(&input.attributes)?;
        model.validate(&input.attributes)?;
        let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        let mut db = store::lock(&self.db)?;
        let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;

        if TombstoneStore::exists(&tx, &id)? {
            return Err(EngineError::Tombstoned(id));
        }
        if EntitiesStore::exists(&tx, &id)? {
            return Err(EngineError::AlreadyExists(id));
        }

        let (parent_id, root_id, ancestors) = if model.is_root() {
            (None, id.clone(), Vec::new())
        } else {
            let parent_id = parent_of(&input.attributes)
                .ok_or_else(|| EngineError::InvalidAttributes("`parent_id` is required".into()))?;
            let ancestors = resolve_parent(&tx, model.as_ref(), &parent_id)?;
            let root_id = ancestors.first().map_or_else(|| parent_id.clone(), |root| root.id.clone());
            (Some(parent_id), root_id, ancestors)
        };

        let role = acl::resolve_role(&tx, &self.user_id, &ancestors)?;
        let ctx = AuthContext { user_id: &self.user_id, role, ancestors: &ancestors, attributes: &input.attributes };
        if !model.can_create(&ctx) {
            return Err(EngineError::Unauthorized(format!("cannot create {} under `{root_id}`", model.type_tag())));
        }

        let replica = Replica::new();
        let delta = replica
            .compute_delta(model.schema(), &input.attributes)?
            .ok_or_else(|| EngineError::InvalidAttributes("attributes are empty".into()))?;
        let attributes = replica.materialize(model.schema())?;

        let row = EntityRow {
            id: id.clone(),
            entity_type: model.type_tag().to_owned(),
            parent_id,
            root_id: root_id.clone(),
            attributes,
            local_revision: 1,
            server_revision: 0,
            created_at: now,
            created_by: self.user_id.clone(),
            updated_at: None,
            updated_by: None,
        };
        EntitiesStore::insert(&tx, &row)?;
        let collaborations = refresh_derived(&tx, model.as_ref(), &id, None, &row.attributes, now)?;
        if model.tracks_transfer() {
            FileStateStore::insert(&tx, &FileState::new_upload(&id, now))?;
        }

        let delta_id = Uuid::new_v4();
        let data = MutationData::CreateEntity {
            entity_id: id.clone(),
            root_id: root_id.clone(),
            delta_id,
            data_b64: encode_b64(&delta),
            created_at: now,
        };
        self.record_delta(&tx, &row, delta_id, delta, data, now)?;
        tx.commit().map_err(anyhow::Error::from)?;
        drop(db);

        info!(entity_id = %id, entity_type = model.type_tag(), "entity created");
        self.publish_write(EngineEvent::EntityCreated { entity_id: id, root_id }, collaborations);
        Ok(row)
    }

    /// Read, apply `updater`, authorize and compute the delta. Writes nothing.
    pub fn prepare_update<F>(&self, id: &str, updater: F) -> EngineResult<PreparedUpdate>
    where
        F: FnOnce(&mut Value),
    {
        let db = store::lock(&self.db)?;
        let conn = db.connection();

        let entity = match EntitiesStore::get(conn, id)? {
            Some(row) => row,
            None if TombstoneStore::exists(conn, id)? => return Err(EngineError::Tombstoned(id.to_owned())),
            None => return Err(EngineError::NotFound(id.to_owned())),
        };
        let model = self.registry.get(&entity.entity_type)?;
        let loaded = load_replica(conn, id)?;
        let previous = loaded.replica.materialize(model.schema())?;

        let mut candidate = previous.clone();
        updater(&mut candidate);
        if candidate.get("type") != previous.get("type") {
            return Err(EngineError::InvalidAttributes("`type` cannot change".into()));
        }
        model.validate(&candidate)?;
        let new_parent = parent_of(&candidate);
        if new_parent != parent_of(&previous) {
            if let Some(parent_id) = &new_parent {
                let chain = resolve_parent(conn, model.as_ref(), parent_id)?;
                if chain.iter().any(|row| row.id == id) {
                    return Err(EngineError::InvalidAttributes(format!("`{parent_id}` is a descendant of `{id}`")));
                }
                if chain.first().is_some_and(|root| root.id != entity.root_id) {
                    return Err(EngineError::InvalidAttributes("entities cannot move between roots".into()));
                }
            }
        }

        let (text_changed, attributes_changed) = classify_changes(model.as_ref(), &previous, &candidate);
        if text_changed || attributes_changed {
            let ancestors = EntitiesStore::ancestors(conn, id)?;
            let role = acl::resolve_role(conn, &self.user_id, &ancestors)?;
            let ctx = AuthContext { user_id: &self.user_id, role, ancestors: &ancestors, attributes: &candidate };
            if attributes_changed && !model.can_update_attributes(&ctx) {
                return Err(EngineError::Unauthorized(format!("cannot update attributes of `{id}`")));
            }
            if text_changed && !model.can_update_document(&ctx) {
                return Err(EngineError::Unauthorized(format!("cannot edit the document of `{id}`")));
            }
        }

        let delta = loaded.replica.compute_delta(model.schema(), &candidate)?;
        let attributes = match delta {
            Some(_) => loaded.replica.materialize(model.schema())?,
            None => previous.clone(),
        };
        Ok(PreparedUpdate { entity, previous, attributes, delta })
    }

    /// Persist a prepared update if nobody else committed in between.
    ///
    /// The delta is replayed over the stored state and pending deltas inside
    /// the write transaction, so inbound merges and reverts that landed after
    /// `prepare_update` are kept in the materialized row.
    pub fn commit_update(&self, prepared: PreparedUpdate) -> EngineResult<CommitOutcome> {
        let PreparedUpdate { entity, delta, .. } = prepared;
        let Some(delta) = delta else {
            return Ok(CommitOutcome::NoOp(entity));
        };
        let model = self.registry.get(&entity.entity_type)?;
        let now = Utc::now();

        let mut db = store::lock(&self.db)?;
        let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;

        let current = match EntitiesStore::get(&tx, &entity.id)? {
            Some(row) => row,
            None if TombstoneStore::exists(&tx, &entity.id)? => return Err(EngineError::Tombstoned(entity.id)),
            None => return Err(EngineError::NotFound(entity.id)),
        };
        if current.local_revision != entity.local_revision {
            return Ok(CommitOutcome::Retry);
        }
        let loaded = load_replica(&tx, &current.id)?;
        loaded.replica.apply_delta(&delta)?;
        let attributes = loaded.replica.materialize(model.schema())?;

        let parent_id = parent_of(&attributes).or_else(|| current.parent_id.clone());
        let written = EntitiesStore::update_local(
            &tx,
            &current.id,
            &attributes,
            parent_id.as_deref(),
            current.local_revision,
            now,
            &self.user_id,
        )?;
        if !written {
            return Ok(CommitOutcome::Retry);
        }

        let previous = current.attributes.clone();
        let row = EntityRow {
            attributes,
            parent_id,
            local_revision: current.local_revision + 1,
            updated_at: Some(now),
            updated_by: Some(self.user_id.clone()),
            ..current
        };
        let collaborations = refresh_derived(&tx, model.as_ref(), &row.id, Some(&previous), &row.attributes, now)?;

        let delta_id = Uuid::new_v4();
        let data = MutationData::UpdateEntity {
            entity_id: row.id.clone(),
            root_id: row.root_id.clone(),
            delta_id,
            data_b64: encode_b64(&delta),
            created_at: now,
        };
        self.record_delta(&tx, &row, delta_id, delta, data, now)?;
        tx.commit().map_err(anyhow::Error::from)?;
        drop(db);

        debug!(entity_id = %row.id, local_revision = row.local_revision, "entity updated");
        self.publish_write(
            EngineEvent::EntityUpdated {
                entity_id: row.id.clone(),
                root_id: row.root_id.clone(),
                local_revision: row.local_revision,
            },
            collaborations,
        );
        Ok(CommitOutcome::Committed(row))
    }

    /// Apply `updater` to the current attributes, retrying when a concurrent
    /// writer commits first.
    pub async fn update_entity<F>(&self, id: &str, mut updater: F) -> EngineResult<UpdateOutcome>
    where
        F: FnMut(&mut Value),
    {
        for attempt in 0..self.retry.max_attempts {
            let prepared = self.prepare_update(id, &mut updater)?;
            match self.commit_update(prepared)? {
                CommitOutcome::Committed(row) => return Ok(UpdateOutcome::Updated(row)),
                CommitOutcome::NoOp(row) => return Ok(UpdateOutcome::Unchanged(row)),
                CommitOutcome::Retry => {
                    debug!(entity_id = id, attempt, "local revision moved, retrying update");
                    let backoff = self.retry.backoff(attempt);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        warn!(entity_id = id, attempts = self.retry.max_attempts, "update gave up after repeated conflicts");
        Err(EngineError::RetryExhausted { entity_id: id.to_owned(), attempts: self.retry.max_attempts })
    }

    pub fn delete_entity(&self, id: &str) -> EngineResult<TombstoneRecord> {
        let now = Utc::now();
        let mut db = store::lock(&self.db)?;
        let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;

        let entity = match EntitiesStore::get(&tx, id)? {
            Some(row) => row,
            None if TombstoneStore::exists(&tx, id)? => return Err(EngineError::Tombstoned(id.to_owned())),
            None => return Err(EngineError::NotFound(id.to_owned())),
        };
        let model = self.registry.get(&entity.entity_type)?;
        let ancestors = EntitiesStore::ancestors(&tx, id)?;
        let role = acl::resolve_role(&tx, &self.user_id, &ancestors)?;
        let ctx = AuthContext { user_id: &self.user_id, role, ancestors: &ancestors, attributes: &entity.attributes };
        if !model.can_delete(&ctx) {
            return Err(EngineError::Unauthorized(format!("cannot delete `{id}`")));
        }

        let deletion = cleanup::delete_local(&tx, &entity, &self.user_id, now)?;
        MutationQueue::new(&tx).enqueue(&Mutation {
            id: Uuid::new_v4(),
            created_at: now,
            data: MutationData::DeleteEntity {
                entity_id: entity.id.clone(),
                root_id: entity.root_id.clone(),
                deleted_at: now,
            },
        })?;
        tx.commit().map_err(anyhow::Error::from)?;
        drop(db);

        info!(entity_id = id, "entity deleted");
        self.publish_write(
            EngineEvent::EntityDeleted { entity_id: entity.id, root_id: entity.root_id },
            deletion.collaborations,
        );
        Ok(deletion.tombstone)
    }

    /// React to an entity. Returns `false` when the reaction was already there.
    pub fn add_reaction(&self, entity_id: &str, reaction: &str) -> EngineResult<bool> {
        self.write_reaction(entity_id, reaction, true)
    }

    /// Withdraw a reaction. Returns `false` when there was none.
    pub fn remove_reaction(&self, entity_id: &str, reaction: &str) -> EngineResult<bool> {
        self.write_reaction(entity_id, reaction, false)
    }

    fn write_reaction(&self, entity_id: &str, reaction: &str, add: bool) -> EngineResult<bool> {
        if reaction.trim().is_empty() {
            return Err(EngineError::InvalidAttributes("reaction must not be empty".into()));
        }
        let now = Utc::now();
        let mut db = store::lock(&self.db)?;
        let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;

        let entity = match EntitiesStore::get(&tx, entity_id)? {
            Some(row) => row,
            None if TombstoneStore::exists(&tx, entity_id)? => {
                return Err(EngineError::Tombstoned(entity_id.to_owned()));
            }
            None => return Err(EngineError::NotFound(entity_id.to_owned())),
        };
        let model = self.registry.get(&entity.entity_type)?;
        let ancestors = EntitiesStore::ancestors(&tx, entity_id)?;
        let role = acl::resolve_role(&tx, &self.user_id, &ancestors)?;
        let ctx = AuthContext { user_id: &self.user_id, role, ancestors: &ancestors, attributes: &entity.attributes };
        if !model.can_react(&ctx) {
            return Err(EngineError::Unauthorized(format!("cannot react to `{entity_id}`")));
        }

        let (changed, data) = if add {
            let row = ReactionRow {
                entity_id: entity_id.to_owned(),
                collaborator_id: self.user_id.clone(),
                reaction: reaction.to_owned(),
                root_id: entity.root_id.clone(),
                revision: 0,
                created_at: now,
                deleted_at: None,
            };
            let data = MutationData::CreateReaction {
                entity_id: entity_id.to_owned(),
                root_id: entity.root_id.clone(),
                reaction: reaction.to_owned(),
                created_at: now,
            };
            (ReactionStore::insert_local(&tx, &row)?, data)
        } else {
            let data = MutationData::DeleteReaction {
                entity_id: entity_id.to_owned(),
                root_id: entity.root_id.clone(),
                reaction: reaction.to_owned(),
                deleted_at: now,
            };
            (ReactionStore::soft_delete(&tx, entity_id, &self.user_id, reaction, now)?, data)
        };
        if !changed {
            return Ok(false);
        }

        let count = ReactionStore::refresh_count(&tx, entity_id)?;
        MutationQueue::new(&tx).enqueue(&Mutation { id: Uuid::new_v4(), created_at: now, data })?;
        tx.commit().map_err(anyhow::Error::from)?;
        drop(db);

        self.events.publish(EngineEvent::ReactionChanged {
            entity_id: entity_id.to_owned(),
            reaction: reaction.to_owned(),
            count,
        });
        self.wake_outbox();
        Ok(true)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get_entity(&self, id: &str) -> EngineResult<Option<EntityRow>> {
        let db = store::lock(&self.db)?;
        Ok(EntitiesStore::get(db.connection(), id)?)
    }

    pub fn list_children(&self, parent_id: &str) -> EngineResult<Vec<EntityRow>> {
        let db = store::lock(&self.db)?;
        Ok(EntitiesStore::list_children(db.connection(), parent_id)?)
    }

    pub fn search(&self, query: &str, limit: usize) -> EngineResult<Vec<SearchHit>> {
        let db = store::lock(&self.db)?;
        Ok(SearchStore::search(db.connection(), query, limit)?)
    }

    pub fn file_state(&self, id: &str) -> EngineResult<Option<FileState>> {
        let db = store::lock(&self.db)?;
        Ok(FileStateStore::get(db.connection(), id)?)
    }

    pub fn tombstone(&self, id: &str) -> EngineResult<Option<TombstoneRecord>> {
        let db = store::lock(&self.db)?;
        Ok(TombstoneStore::get(db.connection(), id)?)
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Append the pending delta and its mutation in the write transaction.
    fn record_delta(
        &self,
        conn: &Connection,
        row: &EntityRow,
        delta_id: Uuid,
        delta: Vec<u8>,
        data: MutationData,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mutation = Mutation { id: Uuid::new_v4(), created_at: now, data };
        DeltaLog::append(
            conn,
            &PendingDelta {
                seq: 0,
                delta_id,
                entity_id: row.id.clone(),
                root_id: row.root_id.clone(),
                data: delta,
                created_at: now,
                created_by: self.user_id.clone(),
                mutation_id: mutation.id,
            },
        )?;
        MutationQueue::new(conn).enqueue(&mutation)?;
        Ok(())
    }

    fn publish_write(&self, event: EngineEvent, collaborations: Vec<CollaborationChange>) {
        self.events.publish(event);
        self.events.publish_all(collaborations.into_iter().map(collaboration_event));
        self.wake_outbox();
    }

    fn wake_outbox(&self) {
        if let Some(trigger) = &self.outbox_trigger {
            trigger.fire();
        }
    }
}

pub(crate) fn collaboration_event(change: CollaborationChange) -> EngineEvent {
    EngineEvent::CollaborationChanged {
        entity_id: change.entity_id,
        collaborator_id: change.collaborator_id,
        role: change.role,
    }
}

pub(crate) fn encode_b64(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub(crate) fn decode_b64(data: &str) -> EngineResult<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|error| EngineError::Malformed(format!("invalid base64 payload: {error}")))
}

/// Root-to-parent chain for a new child of `parent_id`, checking that the
/// parent is live and of an allowed type.
fn resolve_parent(conn: &Connection, model: &dyn EntityModel, parent_id: &str) -> EngineResult<Vec<EntityRow>> {
    let Some(parent) = EntitiesStore::get(conn, parent_id)? else {
        if TombstoneStore::exists(conn, parent_id)? {
            return Err(EngineError::Tombstoned(parent_id.to_owned()));
        }
        return Err(EngineError::NotFound(parent_id.to_owned()));
    };
    if !model.parent_types().contains(&parent.entity_type.as_str()) {
        return Err(EngineError::InvalidAttributes(format!(
            "a {} cannot be placed under a {}",
            model.type_tag(),
            parent.entity_type
        )));
    }
    Ok(EntitiesStore::ancestors(conn, parent_id)?)
}

/// Which capability an edit needs: (document text changed, other fields changed).
fn classify_changes(model: &dyn EntityModel, previous: &Value, candidate: &Value) -> (bool, bool) {
    let mut text_changed = false;
    let mut attributes_changed = false;
    for field in model.schema().fields() {
        if previous.get(field.name) == candidate.get(field.name) {
            continue;
        }
        if field.kind == crate::engine::FieldKind::Text {
            text_changed = true;
        } else {
            attributes_changed = true;
        }
    }
    (text_changed, attributes_changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MutationQueue;
    use crate::store::{MetaDb, UploadStatus};
    use loam_common::protocol::mutations::MutationKind;
    use serde_json::json;

    fn store_for(user: &str) -> EntityStore {
        let db = store::shared(MetaDb::open_in_memory().expect("db"));
        EntityStore::new(db, Arc::new(ModelRegistry::standard()), EventPublisher::new(), user)
            .with_retry_policy(RetryPolicy::immediate(5))
    }

    fn space(store: &EntityStore) -> EntityRow {
        store
            .create_entity(NewEntity::with_id(
                "space-1",
                json!({ "type": "space", "name": "Team", "collaborators": { "user-1": "admin" } }),
            ))
            .expect("space")
    }

    fn page(store: &EntityStore, id: &str) -> EntityRow {
        store
            .create_entity(NewEntity::with_id(id, json!({ "type": "page", "parent_id": "space-1", "name": "Plan" })))
            .expect("page")
    }

    fn queued_kinds(store: &EntityStore) -> Vec<MutationKind> {
        let db = store::lock(store.db()).expect("lock");
        MutationQueue::new(db.connection()).pending_batch(100).expect("batch").into_iter().map(|r| r.kind).collect()
    }

    #[test]
    fn create_writes_row_delta_and_one_mutation() {
        let store = store_for("user-1");
        space(&store);
        let row = page(&store, "page-1");
        assert_eq!(row.root_id, "space-1");
        assert_eq!(row.local_revision, 1);
        assert_eq!(queued_kinds(&store), vec![MutationKind::CreateEntity, MutationKind::CreateEntity]);

        let db = store::lock(store.db()).expect("lock");
        assert_eq!(DeltaLog::pending_for(db.connection(), "page-1").expect("deltas").len(), 1);
        assert_eq!(
            crate::store::CollaborationStore::active_role(db.connection(), "space-1", "user-1").expect("role"),
            Some(loam_common::types::Role::Admin)
        );
    }

    #[test]
    fn create_rejects_duplicates_tombstones_and_strangers() {
        let store = store_for("user-1");
        space(&store);
        page(&store, "page-1");
        assert!(matches!(
            store.create_entity(NewEntity::with_id("page-1", json!({ "type": "page", "parent_id": "space-1", "name": "x" }))),
            Err(EngineError::AlreadyExists(_))
        ));

        store.delete_entity("page-1").expect("delete");
        assert!(matches!(
            store.create_entity(NewEntity::with_id("page-1", json!({ "type": "page", "parent_id": "space-1", "name": "x" }))),
            Err(EngineError::Tombstoned(_))
        ));

        let stranger = EntityStore::new(store.db().clone(), Arc::new(ModelRegistry::standard()), EventPublisher::new(), "user-9");
        assert!(matches!(
            stranger.create_entity(NewEntity::new(json!({ "type": "page", "parent_id": "space-1", "name": "x" }))),
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[test]
    fn create_validates_before_touching_storage() {
        let store = store_for("user-1");
        space(&store);
        let err = store
            .create_entity(NewEntity::new(json!({ "type": "page", "parent_id": "space-1" })))
            .expect_err("name required");
        assert!(matches!(err, EngineError::InvalidAttributes(_)));
        assert_eq!(queued_kinds(&store).len(), 1);
    }

    #[tokio::test]
    async fn update_bumps_revision_once_and_noop_writes_nothing() {
        let store = store_for("user-1");
        space(&store);
        page(&store, "page-1");

        let outcome = store
            .update_entity("page-1", |attrs| attrs["name"] = json!("Roadmap"))
            .await
            .expect("update");
        let UpdateOutcome::Updated(row) = outcome else { panic!("expected an update") };
        assert_eq!(row.local_revision, 2);
        assert_eq!(row.name(), Some("Roadmap"));

        let outcome = store
            .update_entity("page-1", |attrs| attrs["name"] = json!("Roadmap"))
            .await
            .expect("noop");
        assert!(matches!(outcome, UpdateOutcome::Unchanged(ref row) if row.local_revision == 2));
        assert_eq!(queued_kinds(&store).len(), 3);
    }

    #[test]
    fn two_updaters_from_the_same_revision_never_both_commit() {
        let store = store_for("user-1");
        space(&store);
        page(&store, "page-1");

        let first = store.prepare_update("page-1", |a| a["name"] = json!("A")).expect("prepare");
        let second = store.prepare_update("page-1", |a| a["name"] = json!("B")).expect("prepare");
        assert!(matches!(store.commit_update(first).expect("commit"), CommitOutcome::Committed(_)));
        assert_eq!(store.commit_update(second).expect("commit"), CommitOutcome::Retry);
        assert_eq!(store.get_entity("page-1").expect("get").expect("row").local_revision, 2);
    }

    #[test]
    fn commit_replays_over_a_merge_that_landed_after_prepare() {
        use loam_common::protocol::sync::{SyncItem, SyncPayload};

        let store = store_for("user-1");
        space(&store);
        page(&store, "page-1");
        let model = store.registry().get("page").expect("model");
        {
            let db = store::lock(store.db()).expect("lock");
            for delta in DeltaLog::pending_for(db.connection(), "page-1").expect("deltas") {
                derived::fold_delta(db.connection(), delta.delta_id).expect("fold");
            }
        }

        let prepared = store.prepare_update("page-1", |a| a["body"] = json!("local words")).expect("prepare");
        {
            let db = store::lock(store.db()).expect("lock");
            let conn = db.connection();
            let peer = load_replica(conn, "page-1").expect("load").replica;
            let mut target = peer.materialize(model.schema()).expect("view");
            target["name"] = json!("Remote");
            let delta = peer.compute_delta(model.schema(), &target).expect("delta").expect("changed");
            let item = SyncItem {
                revision: 4,
                payload: SyncPayload::EntityUpdate {
                    entity_id: "page-1".into(),
                    root_id: "space-1".into(),
                    delta_id: Uuid::new_v4(),
                    data_b64: encode_b64(&delta),
                    created_at: Utc::now(),
                    created_by: "user-2".into(),
                },
            };
            crate::sync::merge_item(conn, store.registry(), &item, Utc::now()).expect("merge");
        }

        let CommitOutcome::Committed(row) = store.commit_update(prepared).expect("commit") else {
            panic!("expected a commit");
        };
        assert_eq!(row.name(), Some("Remote"));
        assert_eq!(row.attributes["body"], json!("local words"));
        assert_eq!((row.local_revision, row.server_revision), (2, 4));

        let db = store::lock(store.db()).expect("lock");
        let conn = db.connection();
        let replay = load_replica(conn, "page-1").expect("load").replica.materialize(model.schema()).expect("view");
        assert_eq!(EntitiesStore::get(conn, "page-1").expect("get").expect("row").attributes, replay);
        let hits = SearchStore::search(conn, "Remote", 10).expect("search");
        assert_eq!(hits.first().map(|hit| hit.id.as_str()), Some("page-1"));
    }

    #[tokio::test]
    async fn document_edits_need_only_collaborator_role() {
        let owner = store_for("user-1");
        space(&owner);
        page(&owner, "page-1");
        owner
            .update_entity("space-1", |attrs| attrs["collaborators"]["user-2"] = json!("collaborator"))
            .await
            .expect("grant");

        let guest = EntityStore::new(owner.db().clone(), Arc::new(ModelRegistry::standard()), EventPublisher::new(), "user-2")
            .with_retry_policy(RetryPolicy::immediate(3));
        guest
            .update_entity("page-1", |attrs| attrs["body"] = json!("notes"))
            .await
            .expect("collaborators edit the body");
        let err = guest
            .update_entity("page-1", |attrs| attrs["name"] = json!("Renamed"))
            .await
            .expect_err("renaming needs editor");
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[test]
    fn delete_tombstones_and_enqueues() {
        let store = store_for("user-1");
        space(&store);
        page(&store, "page-1");
        let mut events = store.events().subscribe();

        let tombstone = store.delete_entity("page-1").expect("delete");
        assert_eq!(tombstone.snapshot.expect("snapshot").entity.id, "page-1");
        assert!(store.get_entity("page-1").expect("get").is_none());
        assert_eq!(queued_kinds(&store).last(), Some(&MutationKind::DeleteEntity));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::EntityDeleted { .. })));
        assert!(matches!(store.delete_entity("page-1"), Err(EngineError::Tombstoned(_))));
    }

    #[test]
    fn reactions_maintain_the_counter() {
        let store = store_for("user-1");
        space(&store);
        page(&store, "page-1");

        assert!(store.add_reaction("page-1", "+1").expect("react"));
        assert!(!store.add_reaction("page-1", "+1").expect("duplicate"));
        {
            let db = store::lock(store.db()).expect("lock");
            assert_eq!(
                crate::store::CounterStore::get(db.connection(), "page-1", crate::store::reactions::REACTION_COUNT)
                    .expect("counter"),
                1
            );
        }
        assert!(store.remove_reaction("page-1", "+1").expect("unreact"));
        assert!(!store.remove_reaction("page-1", "+1").expect("already gone"));
        let kinds = queued_kinds(&store);
        assert_eq!(&kinds[kinds.len() - 2..], &[MutationKind::CreateReaction, MutationKind::DeleteReaction]);
    }

    #[test]
    fn files_start_a_pending_upload_and_are_searchable() {
        let store = store_for("user-1");
        space(&store);
        store
            .create_entity(NewEntity::with_id(
                "file-1",
                json!({ "type": "file", "parent_id": "space-1", "name": "quarterly report", "mime_type": "application/pdf", "size": 2048 }),
            ))
            .expect("file");
        let state = store.file_state("file-1").expect("state").expect("tracked");
        assert_eq!(state.upload_status, UploadStatus::Pending);
        let hits = store.search("quarterly", 10).expect("search");
        assert_eq!(hits.first().map(|hit| hit.id.as_str()), Some("file-1"));
    }
}
