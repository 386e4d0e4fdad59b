use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::entity::EntityStore;
use crate::events::{EngineEvent, EventPublisher};
use crate::model::ModelRegistry;
use crate::outbox::{OutboxProcessor, OutboxSettings};
use crate::remote::{HttpRemote, MutationRemote, PullSource};
use crate::scheduler::{run_loop, Trigger};
use crate::store::{self, MetaDb, SharedDb};
use crate::sync::{roots_to_sync, Synchronizer};

type SpawnSync = Arc<dyn Fn(String, Trigger) -> JoinHandle<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    triggers: BTreeMap<String, Trigger>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

/// Sync loops keyed by root id. A root gets its loop the first time it is seen.
#[derive(Clone)]
struct RootLoops {
    spawn: SpawnSync,
    registry: Arc<Mutex<Registry>>,
}

impl RootLoops {
    fn new(spawn: SpawnSync) -> Self {
        Self { spawn, registry: Arc::default() }
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| anyhow!("sync loop registry poisoned"))
    }

    /// Start a loop for `root_id` unless one already runs or shutdown began.
    fn ensure(&self, root_id: &str) -> Result<bool> {
        let mut registry = self.registry()?;
        if registry.closed || registry.triggers.contains_key(root_id) {
            return Ok(false);
        }
        let trigger = Trigger::new();
        let task = (self.spawn)(root_id.to_owned(), trigger.clone());
        registry.triggers.insert(root_id.to_owned(), trigger);
        registry.tasks.push(task);
        info!(root_id, "sync loop started");
        Ok(true)
    }

    fn ensure_all(&self, roots: &[String]) -> Result<()> {
        for root in roots {
            self.ensure(root)?;
        }
        Ok(())
    }

    fn roots(&self) -> Vec<String> {
        self.registry().map(|registry| registry.triggers.keys().cloned().collect()).unwrap_or_default()
    }

    fn fire_all(&self) {
        if let Ok(registry) = self.registry() {
            registry.triggers.values().for_each(Trigger::fire);
        }
    }

    /// Refuse new loops from now on.
    fn close(&self) {
        if let Ok(mut registry) = self.registry() {
            registry.closed = true;
        }
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        self.registry().map(|mut registry| std::mem::take(&mut registry.tasks)).unwrap_or_default()
    }
}

/// Running engine: one outbox loop plus one sync loop per known root.
pub struct EngineHandle {
    store: EntityStore,
    outbox_trigger: Trigger,
    root_loops: RootLoops,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Roots that currently have a sync loop, in id order.
    pub fn roots(&self) -> Vec<String> {
        self.root_loops.roots()
    }

    /// Start pulling `root_id`, e.g. after the user joined a space on another
    /// device. Returns `false` when the root is already synced.
    pub fn add_root(&self, root_id: &str) -> Result<bool> {
        self.root_loops.ensure(root_id)
    }

    pub fn trigger_outbox(&self) {
        self.outbox_trigger.fire();
    }

    /// Wake every sync loop.
    pub fn trigger_sync(&self) {
        self.root_loops.fire_all();
    }

    /// Stop scheduling further runs. A run in progress completes.
    pub fn shutdown(&self) {
        self.root_loops.close();
        let _ = self.shutdown_tx.send(());
    }

    pub async fn wait(mut self) {
        self.shutdown();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for task in self.root_loops.take_tasks() {
            let _ = task.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the entity store the loops and callers share.
pub fn build_store(config: &EngineConfig, db: SharedDb, events: EventPublisher) -> (EntityStore, Trigger) {
    let outbox_trigger = Trigger::new();
    let store = EntityStore::new(
        db,
        Arc::new(ModelRegistry::standard()),
        events,
        config.user_id.clone().unwrap_or_default(),
    )
    .with_retry_policy(config.retry.policy())
    .with_outbox_trigger(outbox_trigger.clone());
    (store, outbox_trigger)
}

/// Spawn the background loops over `db` with the given transports.
pub fn start<R, P>(config: &EngineConfig, db: SharedDb, events: EventPublisher, remote: R, source: P) -> Result<EngineHandle>
where
    R: MutationRemote,
    P: PullSource,
{
    let (store, outbox_trigger) = build_store(config, db, events);
    // Subscribe before any loop runs so no root created from here on is missed.
    let event_rx = store.events().subscribe();
    let (shutdown_tx, _) = broadcast::channel(4);
    let mut tasks = Vec::with_capacity(2);

    let processor = Arc::new(OutboxProcessor::new(store.clone(), remote, OutboxSettings::from(&config.outbox)));
    tasks.push(tokio::spawn(run_loop(
        "outbox",
        config.outbox.schedule(),
        outbox_trigger.clone(),
        shutdown_tx.subscribe(),
        move || {
            let processor = Arc::clone(&processor);
            async move { processor.run_once().await }
        },
    )));

    let synchronizer = Arc::new(Synchronizer::new(store.clone(), source, config.sync.page_size));
    let schedule = config.sync.schedule();
    let loop_shutdown = shutdown_tx.clone();
    let root_loops = RootLoops::new(Arc::new(move |root: String, trigger: Trigger| {
        let synchronizer = Arc::clone(&synchronizer);
        let root = Arc::new(root);
        tokio::spawn(run_loop("sync", schedule, trigger, loop_shutdown.subscribe(), move || {
            let synchronizer = Arc::clone(&synchronizer);
            let root = Arc::clone(&root);
            async move { synchronizer.run_once(&root).await }
        }))
    }));

    let roots = {
        let db = store::lock(store.db())?;
        roots_to_sync(db.connection(), &config.sync.roots)?
    };
    root_loops.ensure_all(&roots)?;
    if config.sync.roots.is_empty() {
        tasks.push(tokio::spawn(discover_roots(
            root_loops.clone(),
            store.db().clone(),
            config.sync.schedule().interval,
            event_rx,
            shutdown_tx.subscribe(),
        )));
    }
    if roots.is_empty() {
        warn!("no roots known yet, sync loops start as roots appear");
    }

    info!(roots = roots.len(), "engine loops started");
    Ok(EngineHandle { store, outbox_trigger, root_loops, shutdown_tx, tasks })
}

/// Start sync loops for roots that appear after startup: spaces created
/// locally (seen through events) and roots written by other handles on the
/// same database (seen by the periodic rescan).
async fn discover_roots(
    root_loops: RootLoops,
    db: SharedDb,
    rescan_every: Duration,
    mut events: broadcast::Receiver<EngineEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut rescan = tokio::time::interval(rescan_every.max(Duration::from_millis(10)));
    loop {
        let wake = tokio::select! {
            event = events.recv() => Discovery::Event(event),
            _ = rescan.tick() => Discovery::Rescan,
            _ = shutdown_rx.recv() => Discovery::Shutdown,
        };
        let found = match wake {
            Discovery::Event(Ok(EngineEvent::EntityCreated { root_id, .. } | EngineEvent::EntityMerged { root_id, .. })) => {
                root_loops.ensure(&root_id).map(|_| ())
            }
            Discovery::Event(Ok(_)) => Ok(()),
            Discovery::Event(Err(RecvError::Lagged(skipped))) => {
                debug!(skipped, "root discovery lagged behind events, rescanning");
                rescan_roots(&root_loops, &db)
            }
            Discovery::Rescan => rescan_roots(&root_loops, &db),
            Discovery::Event(Err(RecvError::Closed)) | Discovery::Shutdown => break,
        };
        if let Err(error) = found {
            warn!(?error, "root discovery failed");
        }
    }
    debug!("root discovery stopped");
}

enum Discovery {
    Event(Result<EngineEvent, RecvError>),
    Rescan,
    Shutdown,
}

fn rescan_roots(root_loops: &RootLoops, db: &SharedDb) -> Result<()> {
    let roots = {
        let db = store::lock(db)?;
        roots_to_sync(db.connection(), &[])?
    };
    root_loops.ensure_all(&roots)
}

/// Open the configured database and run against the HTTP transport until ctrl-c.
pub async fn run_standalone(config: EngineConfig) -> Result<()> {
    config.validate().context("invalid engine configuration")?;
    let database_path = config.database_path()?;
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory `{}`", parent.display()))?;
    }
    let db = store::shared(MetaDb::open(&database_path)?);
    let remote = Arc::new(HttpRemote::from_config(&config)?);

    let handle = start(&config, db, EventPublisher::new(), Arc::clone(&remote), remote)?;
    info!(database = %database_path.display(), "loam engine running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    handle.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use loam_common::protocol::mutations::{Mutation, MutationResult, MutationStatus};
    use loam_common::protocol::sync::{PullRequest, PullResponse};
    use serde_json::json;

    use super::*;
    use crate::entity::NewEntity;
    use crate::outbox::MutationQueue;

    #[derive(Default)]
    struct Recorder {
        submitted: Mutex<Vec<Mutation>>,
        pulls: Mutex<Vec<PullRequest>>,
    }

    impl MutationRemote for Recorder {
        async fn submit(&self, batch: Vec<Mutation>) -> anyhow::Result<Vec<MutationResult>> {
            let results = batch.iter().map(|m| MutationResult { id: m.id, status: MutationStatus::Success }).collect();
            self.submitted.lock().expect("submitted").extend(batch);
            Ok(results)
        }
    }

    impl PullSource for Recorder {
        async fn pull(&self, request: PullRequest) -> anyhow::Result<PullResponse> {
            self.pulls.lock().expect("pulls").push(request);
            Ok(PullResponse { items: Vec::new() })
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig { user_id: Some("user-1".into()), ..EngineConfig::default() };
        config.sync.roots = vec!["space-1".into()];
        config.outbox.debounce_ms = 10;
        config
    }

    #[tokio::test]
    async fn loops_run_on_start_and_stop_on_shutdown() {
        let db = store::shared(MetaDb::open_in_memory().expect("db"));
        let recorder = Arc::new(Recorder::default());
        let handle =
            start(&config(), db, EventPublisher::new(), Arc::clone(&recorder), Arc::clone(&recorder)).expect("start");
        assert_eq!(handle.roots(), ["space-1".to_owned()]);

        for _ in 0..100 {
            if recorder.pulls.lock().expect("pulls").len() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.pulls.lock().expect("pulls").len(), 5);

        tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.expect("loops stop");
    }

    async fn pulled_roots(recorder: &Recorder, root: &str) -> usize {
        for _ in 0..200 {
            let seen = recorder.pulls.lock().expect("pulls").iter().filter(|p| p.root_id == root).count();
            if seen > 0 {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    #[tokio::test]
    async fn a_space_created_after_start_gets_its_own_loop() {
        let mut config = config();
        config.sync.roots.clear();
        let db = store::shared(MetaDb::open_in_memory().expect("db"));
        let recorder = Arc::new(Recorder::default());
        let handle =
            start(&config, db, EventPublisher::new(), Arc::clone(&recorder), Arc::clone(&recorder)).expect("start");
        assert!(handle.roots().is_empty());

        handle
            .store()
            .create_entity(NewEntity::with_id(
                "space-2",
                json!({ "type": "space", "name": "Later", "collaborators": { "user-1": "admin" } }),
            ))
            .expect("space");

        assert!(pulled_roots(&recorder, "space-2").await > 0);
        assert_eq!(handle.roots(), ["space-2".to_owned()]);
        tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.expect("loops stop");
    }

    #[tokio::test]
    async fn add_root_starts_pulling_a_root_with_no_local_rows() {
        let mut config = config();
        config.sync.roots.clear();
        let db = store::shared(MetaDb::open_in_memory().expect("db"));
        let recorder = Arc::new(Recorder::default());
        let handle =
            start(&config, db, EventPublisher::new(), Arc::clone(&recorder), Arc::clone(&recorder)).expect("start");

        assert!(handle.add_root("space-9").expect("add"));
        assert!(!handle.add_root("space-9").expect("add again"));
        assert!(pulled_roots(&recorder, "space-9").await > 0);

        handle.shutdown();
        assert!(!handle.add_root("space-10").expect("closed"));
        tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.expect("loops stop");
    }

    #[tokio::test]
    async fn writes_wake_the_outbox() {
        let db = store::shared(MetaDb::open_in_memory().expect("db"));
        let recorder = Arc::new(Recorder::default());
        let handle =
            start(&config(), db, EventPublisher::new(), Arc::clone(&recorder), Arc::clone(&recorder)).expect("start");

        handle
            .store()
            .create_entity(NewEntity::with_id(
                "space-1",
                json!({ "type": "space", "name": "Team", "collaborators": { "user-1": "admin" } }),
            ))
            .expect("space");

        for _ in 0..200 {
            if !recorder.submitted.lock().expect("submitted").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.submitted.lock().expect("submitted").len(), 1);
        {
            let db = store::lock(handle.store().db()).expect("lock");
            assert_eq!(MutationQueue::new(db.connection()).count_pending().expect("count"), 0);
        }
        tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.expect("loops stop");
    }
}
