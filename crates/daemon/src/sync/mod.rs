// Inbound synchronizer: pulls remote changes per root and change kind by
// revision cursor and merges them into the local store.
//
// Each item is merged in its own transaction together with the cursor
// advance, so a crash between items resumes from the last merged revision
// and re-merging an item is harmless.

use chrono::{DateTime, Utc};
use loam_common::protocol::sync::{ChangeKind, PullRequest, SyncItem, SyncPayload};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::cleanup;
use crate::engine::Replica;
use crate::entity::derived::{parent_of, refresh_derived, rematerialize};
use crate::entity::{collaboration_event, decode_b64, EntityStore};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::model::ModelRegistry;
use crate::remote::PullSource;
use crate::scheduler::RunOutcome;
use crate::store::{
    self, CollaborationRow, CursorStore, DeltaLog, EntitiesStore, EntityRow, EntityState, InteractionRow,
    InteractionStore, ReactionRow, ReactionStore, TombstoneStore,
};

/// What one stream pull did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub pages: usize,
    pub merged: usize,
    /// Items at or below the cursor, ignored.
    pub skipped: usize,
    pub cursor: i64,
}

/// Per-stream results of one pass over a root.
#[derive(Debug, Default)]
pub struct RootReport {
    pub streams: Vec<(ChangeKind, StreamReport)>,
    pub failures: Vec<(ChangeKind, EngineError)>,
}

impl RootReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.failures.is_empty() {
            RunOutcome::Idle
        } else {
            RunOutcome::Failed
        }
    }

    pub fn merged(&self) -> usize {
        self.streams.iter().map(|(_, report)| report.merged).sum()
    }
}

pub struct Synchronizer<P> {
    store: EntityStore,
    source: P,
    page_size: u32,
}

impl<P: PullSource> Synchronizer<P> {
    pub fn new(store: EntityStore, source: P, page_size: u32) -> Self {
        Self { store, source, page_size: page_size.max(1) }
    }

    /// Pull one stream until a short page says it is caught up.
    ///
    /// A failing item stops the stream with its cursor left at the last
    /// merged revision. A full page that does not move the cursor is an
    /// error, otherwise the same page would be requested forever.
    pub async fn sync_stream(&self, root_id: &str, kind: ChangeKind) -> EngineResult<StreamReport> {
        let mut report = StreamReport::default();
        let mut cursor = {
            let db = store::lock(self.store.db())?;
            CursorStore::get(db.connection(), root_id, kind)?
        };

        loop {
            let request = PullRequest { root_id: root_id.to_owned(), kind, cursor, limit: self.page_size };
            let response = self
                .source
                .pull(request)
                .await
                .map_err(|error| EngineError::Remote(format!("{error:#}")))?;
            report.pages += 1;
            let page_len = response.items.len();
            let page_start = cursor;

            for item in response.items {
                if item.revision <= cursor {
                    report.skipped += 1;
                    continue;
                }
                if item.payload.kind() != kind {
                    return Err(EngineError::Remote(format!(
                        "`{}` stream returned a `{}` item at revision {}",
                        kind.as_str(),
                        item.payload.kind().as_str(),
                        item.revision
                    )));
                }
                if let Err(error) = self.merge(root_id, &item) {
                    warn!(root_id, kind = kind.as_str(), revision = item.revision, ?error, "merge failed, stream stopped");
                    return Err(error);
                }
                cursor = item.revision;
                report.merged += 1;
            }

            if page_len < self.page_size as usize {
                break;
            }
            if cursor == page_start {
                warn!(root_id, kind = kind.as_str(), cursor, "full page made no progress, stream stopped");
                return Err(EngineError::Remote(format!(
                    "`{}` stream returned a full page at or below cursor {cursor}",
                    kind.as_str()
                )));
            }
        }

        report.cursor = cursor;
        if report.merged > 0 {
            debug!(root_id, kind = kind.as_str(), merged = report.merged, cursor, "stream caught up");
        }
        self.store.events().publish(EngineEvent::SyncCompleted { root_id: root_id.to_owned(), kind, cursor });
        Ok(report)
    }

    /// Pull every change kind of `root_id`. A failing stream does not stop the others.
    pub async fn sync_root(&self, root_id: &str) -> RootReport {
        let mut report = RootReport::default();
        for kind in ChangeKind::ALL {
            match self.sync_stream(root_id, kind).await {
                Ok(stream) => report.streams.push((kind, stream)),
                Err(error) => {
                    warn!(root_id, kind = kind.as_str(), %error, "sync stream failed");
                    report.failures.push((kind, error));
                }
            }
        }
        let merged = report.merged();
        if merged > 0 {
            info!(root_id, merged, failed = report.failures.len(), "root synced");
        }
        report
    }

    pub async fn run_once(&self, root_id: &str) -> RunOutcome {
        self.sync_root(root_id).await.outcome()
    }

    /// Merge one item and advance its cursor in the same transaction.
    fn merge(&self, root_id: &str, item: &SyncItem) -> EngineResult<()> {
        let now = Utc::now();
        let kind = item.payload.kind();
        let events = {
            let mut db = store::lock(self.store.db())?;
            let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;
            let events = merge_item(&tx, self.store.registry(), item, now)?;
            CursorStore::advance(&tx, root_id, kind, item.revision, now)?;
            tx.commit().map_err(anyhow::Error::from)?;
            events
        };
        self.store.events().publish_all(events);
        Ok(())
    }
}

/// Roots to pull: the configured list, or every root with local entities.
pub fn roots_to_sync(conn: &Connection, configured: &[String]) -> anyhow::Result<Vec<String>> {
    if !configured.is_empty() {
        return Ok(configured.to_vec());
    }
    EntitiesStore::list_roots(conn)
}

/// Apply one remote item inside the caller's transaction and return the
/// events to publish after commit.
pub fn merge_item(
    conn: &Connection,
    registry: &ModelRegistry,
    item: &SyncItem,
    now: DateTime<Utc>,
) -> EngineResult<Vec<EngineEvent>> {
    let revision = item.revision;
    let mut events = Vec::new();
    match &item.payload {
        SyncPayload::EntityUpdate { entity_id, root_id, delta_id, data_b64, created_at, created_by } => {
            if TombstoneStore::exists(conn, entity_id)? {
                debug!(entity_id, revision, "update for tombstoned entity skipped");
                return Ok(events);
            }
            let data = decode_b64(data_b64)?;
            let state = DeltaLog::get_state(conn, entity_id)?;
            let replica = Replica::from_state(state.as_ref().map_or(&[][..], |s| s.state.as_slice()))?;
            replica.apply_delta(&data)?;
            DeltaLog::put_state(
                conn,
                &EntityState {
                    id: entity_id.clone(),
                    state: replica.export_state(),
                    revision: state.map_or(revision, |s| s.revision.max(revision)),
                },
            )?;
            if DeltaLog::remove(conn, *delta_id)? {
                debug!(entity_id, %delta_id, "pending delta echoed by the server");
            }

            if EntitiesStore::exists(conn, entity_id)? {
                if let Some(outcome) = rematerialize(conn, registry, entity_id, now)? {
                    events.extend(outcome.collaborations.into_iter().map(collaboration_event));
                }
            } else {
                let changes = insert_merged(conn, registry, &replica, entity_id, root_id, created_at, created_by, revision, now)?;
                events.extend(changes.into_iter().map(collaboration_event));
            }
            EntitiesStore::advance_server_revision(conn, entity_id, revision)?;
            events.insert(
                0,
                EngineEvent::EntityMerged {
                    entity_id: entity_id.clone(),
                    root_id: root_id.clone(),
                    server_revision: revision,
                },
            );
        }
        SyncPayload::Tombstone { entity_id, root_id, deleted_at, deleted_by } => {
            if let Some(deletion) = cleanup::apply_remote_tombstone(conn, entity_id, root_id, deleted_by, *deleted_at, revision)? {
                if deletion.had_row {
                    events.push(EngineEvent::EntityDeleted { entity_id: entity_id.clone(), root_id: root_id.clone() });
                }
                events.extend(deletion.collaborations.into_iter().map(collaboration_event));
            }
        }
        SyncPayload::Collaboration { entity_id, collaborator_id, role, created_at, deleted_at } => {
            let row = CollaborationRow {
                entity_id: entity_id.clone(),
                collaborator_id: collaborator_id.clone(),
                role: *role,
                revision,
                created_at: *created_at,
                updated_at: Some(now),
                deleted_at: *deleted_at,
            };
            if store::CollaborationStore::upsert_remote(conn, &row)? {
                events.push(EngineEvent::CollaborationChanged {
                    entity_id: entity_id.clone(),
                    collaborator_id: collaborator_id.clone(),
                    role: deleted_at.is_none().then_some(*role),
                });
            }
        }
        SyncPayload::Reaction { entity_id, root_id, collaborator_id, reaction, created_at, deleted_at } => {
            let row = ReactionRow {
                entity_id: entity_id.clone(),
                collaborator_id: collaborator_id.clone(),
                reaction: reaction.clone(),
                root_id: root_id.clone(),
                revision,
                created_at: *created_at,
                deleted_at: *deleted_at,
            };
            if ReactionStore::upsert_remote(conn, &row)? && EntitiesStore::exists(conn, entity_id)? {
                let count = ReactionStore::refresh_count(conn, entity_id)?;
                events.push(EngineEvent::ReactionChanged {
                    entity_id: entity_id.clone(),
                    reaction: reaction.clone(),
                    count,
                });
            }
        }
        SyncPayload::Interaction { entity_id, root_id, collaborator_id, first_seen_at, last_seen_at, last_opened_at } => {
            InteractionStore::upsert_remote(
                conn,
                &InteractionRow {
                    entity_id: entity_id.clone(),
                    collaborator_id: collaborator_id.clone(),
                    root_id: root_id.clone(),
                    first_seen_at: *first_seen_at,
                    last_seen_at: *last_seen_at,
                    last_opened_at: *last_opened_at,
                    revision,
                },
            )?;
        }
    }
    Ok(events)
}

/// First sighting of a remote entity: build its row from the merged state.
#[allow(clippy::too_many_arguments)]
fn insert_merged(
    conn: &Connection,
    registry: &ModelRegistry,
    replica: &Replica,
    entity_id: &str,
    root_id: &str,
    created_at: &DateTime<Utc>,
    created_by: &str,
    revision: i64,
    now: DateTime<Utc>,
) -> EngineResult<Vec<crate::acl::CollaborationChange>> {
    let tag = replica
        .type_tag()?
        .ok_or_else(|| EngineError::Malformed(format!("merged state of `{entity_id}` has no type")))?;
    let model = registry.get(&tag)?;
    let attributes = replica.materialize(model.schema())?;
    let row = EntityRow {
        id: entity_id.to_owned(),
        entity_type: tag,
        parent_id: parent_of(&attributes),
        root_id: root_id.to_owned(),
        attributes,
        local_revision: 0,
        server_revision: revision,
        created_at: *created_at,
        created_by: created_by.to_owned(),
        updated_at: None,
        updated_by: None,
    };
    EntitiesStore::insert(conn, &row)?;
    let changes = refresh_derived(conn, model.as_ref(), entity_id, None, &row.attributes, now)?;
    debug!(entity_id, entity_type = %row.entity_type, revision, "remote entity materialized");
    Ok(changes)
}
