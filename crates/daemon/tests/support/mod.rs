// Shared fakes for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use loam_common::protocol::mutations::{Mutation, MutationResult, MutationStatus};
use loam_common::protocol::sync::{ChangeKind, PullRequest, PullResponse, SyncItem, SyncPayload};
use loam_daemon::engine::{Replica, Schema};
use loam_daemon::entity::{EntityStore, NewEntity};
use loam_daemon::events::EventPublisher;
use loam_daemon::model::ModelRegistry;
use loam_daemon::remote::{MutationRemote, PullSource};
use loam_daemon::retry::RetryPolicy;
use loam_daemon::store::{self, MetaDb, SharedDb};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn memory_db() -> SharedDb {
    store::shared(MetaDb::open_in_memory().expect("in-memory db"))
}

pub fn file_db(path: &Path) -> SharedDb {
    store::shared(MetaDb::open(path).expect("db file"))
}

pub fn entity_store(db: SharedDb, user: &str) -> EntityStore {
    EntityStore::new(db, Arc::new(ModelRegistry::standard()), EventPublisher::new(), user)
        .with_retry_policy(RetryPolicy::immediate(10))
}

/// `space-1` administered by `user-1` with one page `page-1` under it.
pub fn seed_space_and_page(store: &EntityStore) {
    store
        .create_entity(NewEntity::with_id(
            "space-1",
            json!({ "type": "space", "name": "Team", "collaborators": { "user-1": "admin" } }),
        ))
        .expect("space should be created");
    store
        .create_entity(NewEntity::with_id("page-1", json!({ "type": "page", "parent_id": "space-1", "name": "Plan" })))
        .expect("page should be created");
}

/// Remote answering each submission with the next scripted response.
/// Once the script runs out every mutation succeeds.
#[derive(Default)]
pub struct FakeRemote {
    script: Mutex<VecDeque<Scripted>>,
    batches: Mutex<Vec<Vec<Mutation>>>,
}

pub enum Scripted {
    /// Per-position statuses for the batch.
    Statuses(Vec<MutationStatus>),
    TransportError,
}

impl FakeRemote {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into_iter().collect()), batches: Mutex::new(Vec::new()) })
    }

    pub fn batches(&self) -> Vec<Vec<Mutation>> {
        self.batches.lock().expect("batches").clone()
    }

    pub fn delivered_ids(&self) -> Vec<Uuid> {
        self.batches().into_iter().flatten().map(|m| m.id).collect()
    }
}

impl MutationRemote for FakeRemote {
    async fn submit(&self, batch: Vec<Mutation>) -> anyhow::Result<Vec<MutationResult>> {
        self.batches.lock().expect("batches").push(batch.clone());
        let next = self.script.lock().expect("script").pop_front();
        match next {
            Some(Scripted::TransportError) => anyhow::bail!("connection reset"),
            Some(Scripted::Statuses(statuses)) => Ok(batch
                .iter()
                .zip(statuses)
                .map(|(mutation, status)| MutationResult { id: mutation.id, status })
                .collect()),
            None => Ok(batch.iter().map(|m| MutationResult { id: m.id, status: MutationStatus::Success }).collect()),
        }
    }
}

/// Server-side change log per (root, kind), served by cursor and limit.
#[derive(Default)]
pub struct FakePullSource {
    log: Mutex<HashMap<(String, ChangeKind), Vec<SyncItem>>>,
    requests: Mutex<Vec<PullRequest>>,
}

impl FakePullSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, root_id: &str, revision: i64, payload: SyncPayload) {
        self.log
            .lock()
            .expect("log")
            .entry((root_id.to_owned(), payload.kind()))
            .or_default()
            .push(SyncItem { revision, payload });
    }

    pub fn requests(&self) -> Vec<PullRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl PullSource for FakePullSource {
    async fn pull(&self, request: PullRequest) -> anyhow::Result<PullResponse> {
        self.requests.lock().expect("requests").push(request.clone());
        let log = self.log.lock().expect("log");
        let items = log
            .get(&(request.root_id.clone(), request.kind))
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.revision > request.cursor)
                    .take(request.limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(PullResponse { items })
    }
}

/// A remote peer's edit: the delta that moves `base` to `target`.
pub fn peer_delta(base: &Replica, schema: &Schema, target: Value) -> Vec<u8> {
    base.compute_delta(schema, &target).expect("valid attributes").expect("a change")
}

pub fn entity_update(entity_id: &str, root_id: &str, delta: &[u8]) -> SyncPayload {
    use base64::Engine as _;
    SyncPayload::EntityUpdate {
        entity_id: entity_id.into(),
        root_id: root_id.into(),
        delta_id: Uuid::new_v4(),
        data_b64: base64::engine::general_purpose::STANDARD.encode(delta),
        created_at: Utc::now(),
        created_by: "user-2".into(),
    }
}
