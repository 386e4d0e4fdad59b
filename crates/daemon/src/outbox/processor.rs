// Outbox drain: submit pending mutations and settle each result.
//
// Per item:
//   success            → fold the delta into the compacted state, drop the record
//   error              → revert the local effect, drop the record
//   transport failure  → retry_count + 1, `failed` at the ceiling
// An id missing from the response counts as a transport failure for that item.

use std::collections::HashMap;

use chrono::Utc;
use loam_common::protocol::mutations::{MutationData, MutationStatus};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{revert::revert, MutationQueue, MutationRecord, MutationState};
use crate::config::OutboxConfig;
use crate::entity::derived::fold_delta;
use crate::entity::EntityStore;
use crate::error::EngineResult;
use crate::events::EngineEvent;
use crate::remote::MutationRemote;
use crate::scheduler::RunOutcome;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxSettings {
    pub batch_size: u32,
    pub max_retries: u32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self::from(&OutboxConfig::default())
    }
}

impl From<&OutboxConfig> for OutboxSettings {
    fn from(config: &OutboxConfig) -> Self {
        Self { batch_size: config.batch_size.max(1), max_retries: config.max_retries.max(1) }
    }
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub submitted: usize,
    pub acked: usize,
    pub reverted: usize,
    /// Transport failures left pending for another attempt.
    pub retried: usize,
    /// Records that hit the retry ceiling during this pass.
    pub failed: usize,
    /// Whether the whole submission failed in transport.
    pub transport_error: bool,
    /// Whether the batch was full, so more records may be waiting.
    pub batch_full: bool,
}

impl DrainReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.transport_error {
            RunOutcome::Failed
        } else if self.batch_full {
            RunOutcome::MoreWork
        } else {
            RunOutcome::Idle
        }
    }
}

pub struct OutboxProcessor<R> {
    store: EntityStore,
    remote: R,
    settings: OutboxSettings,
}

impl<R: MutationRemote> OutboxProcessor<R> {
    pub fn new(store: EntityStore, remote: R, settings: OutboxSettings) -> Self {
        Self { store, remote, settings }
    }

    /// Submit one batch of pending mutations and settle the results.
    pub async fn drain_once(&self) -> EngineResult<DrainReport> {
        let batch = {
            let db = store::lock(self.store.db())?;
            MutationQueue::new(db.connection()).pending_batch(self.settings.batch_size)?
        };
        if batch.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport {
            submitted: batch.len(),
            batch_full: batch.len() >= self.settings.batch_size as usize,
            ..DrainReport::default()
        };
        let mutations = batch.iter().map(MutationRecord::to_mutation).collect();
        debug!(count = report.submitted, "submitting mutation batch");

        let results = match self.remote.submit(mutations).await {
            Ok(results) => results,
            Err(transport) => {
                warn!(error = %transport, count = batch.len(), "mutation batch submission failed");
                report.transport_error = true;
                let message = format!("{transport:#}");
                for record in &batch {
                    self.settle_transport_failure(record, &message, &mut report)?;
                }
                return Ok(report);
            }
        };

        let statuses: HashMap<Uuid, MutationStatus> =
            results.into_iter().map(|result| (result.id, result.status)).collect();
        for record in &batch {
            match statuses.get(&record.id) {
                Some(MutationStatus::Success) => {
                    self.acknowledge(record)?;
                    report.acked += 1;
                }
                Some(MutationStatus::Error) => {
                    self.revert(record)?;
                    report.reverted += 1;
                }
                None => {
                    self.settle_transport_failure(record, "missing from submission response", &mut report)?;
                }
            }
        }

        info!(
            acked = report.acked,
            reverted = report.reverted,
            retried = report.retried,
            failed = report.failed,
            "mutation batch settled"
        );
        Ok(report)
    }

    /// Drain and translate the result for the background loop.
    pub async fn run_once(&self) -> RunOutcome {
        match self.drain_once().await {
            Ok(report) => report.outcome(),
            Err(error) => {
                error!(?error, "outbox drain failed");
                RunOutcome::Failed
            }
        }
    }

    pub fn list_failed(&self) -> EngineResult<Vec<MutationRecord>> {
        let db = store::lock(self.store.db())?;
        Ok(MutationQueue::new(db.connection()).list_failed()?)
    }

    fn acknowledge(&self, record: &MutationRecord) -> EngineResult<()> {
        let mut db = store::lock(self.store.db())?;
        let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;
        match &record.data {
            MutationData::CreateEntity { delta_id, .. } | MutationData::UpdateEntity { delta_id, .. } => {
                if !fold_delta(&tx, *delta_id)? {
                    debug!(mutation_id = %record.id, "acknowledged delta already gone");
                }
            }
            MutationData::DeleteEntity { .. }
            | MutationData::CreateReaction { .. }
            | MutationData::DeleteReaction { .. } => {}
        }
        MutationQueue::new(&tx).remove(record.id)?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn revert(&self, record: &MutationRecord) -> EngineResult<()> {
        let now = Utc::now();
        let events = {
            let mut db = store::lock(self.store.db())?;
            let tx = db.connection_mut().transaction().map_err(anyhow::Error::from)?;
            let events = revert(&tx, self.store.registry(), record, self.store.user_id(), now)?;
            MutationQueue::new(&tx).remove(record.id)?;
            tx.commit().map_err(anyhow::Error::from)?;
            events
        };
        warn!(mutation_id = %record.id, entity_id = %record.entity_id, kind = record.kind.as_str(), "mutation rejected, local change reverted");
        self.store.events().publish_all(events);
        Ok(())
    }

    fn settle_transport_failure(
        &self,
        record: &MutationRecord,
        message: &str,
        report: &mut DrainReport,
    ) -> EngineResult<()> {
        let state = {
            let db = store::lock(self.store.db())?;
            MutationQueue::new(db.connection()).record_failure(record.id, message, self.settings.max_retries)?
        };
        match state {
            Some(MutationState::Failed) => {
                error!(mutation_id = %record.id, entity_id = %record.entity_id, error = message, "mutation permanently failed");
                report.failed += 1;
                self.store.events().publish(EngineEvent::MutationFailed {
                    mutation_id: record.id,
                    entity_id: record.entity_id.clone(),
                    error: message.to_owned(),
                });
            }
            Some(MutationState::Pending) => report.retried += 1,
            None => {}
        }
        Ok(())
    }
}
