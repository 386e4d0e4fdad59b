// Persistence: SQLite tables behind small per-table stores.

pub mod collaborations;
pub mod cursors;
pub mod deltas;
pub mod entities;
pub mod file_states;
pub mod meta_db;
pub mod reactions;
pub mod references;
pub mod search;
pub mod tombstones;

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

pub use collaborations::{CollaborationRow, CollaborationStore};
pub use cursors::CursorStore;
pub use deltas::{DeltaLog, EntityState, PendingDelta};
pub use entities::{EntitiesStore, EntityRow};
pub use file_states::{DownloadStatus, FileState, FileStateStore, UploadStatus};
pub use meta_db::MetaDb;
pub use reactions::{CounterStore, InteractionRow, InteractionStore, ReactionRow, ReactionStore};
pub use references::ReferenceStore;
pub use search::{SearchHit, SearchStore};
pub use tombstones::{TombstoneOrigin, TombstoneRecord, TombstoneSnapshot, TombstoneStore};

/// The single local database handle shared by the engine and its loops.
pub type SharedDb = Arc<Mutex<MetaDb>>;

pub fn shared(db: MetaDb) -> SharedDb {
    Arc::new(Mutex::new(db))
}

/// Lock the shared handle. Hold the guard for one transaction only.
pub fn lock(db: &SharedDb) -> anyhow::Result<MutexGuard<'_, MetaDb>> {
    db.lock().map_err(|_| anyhow::anyhow!("local database mutex poisoned"))
}

/// Decode an RFC 3339 column, reporting the column on failure.
pub(crate) fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc)).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
    })
}

pub(crate) fn parse_optional_timestamp(
    column: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_timestamp(column, &raw)).transpose()
}

pub(crate) fn parse_uuid(column: usize, raw: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
    })
}

pub(crate) fn parse_json(column: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
    })
}

/// Report a column holding an unrecognised enum value.
pub(crate) fn invalid_value(column: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(format!("unknown {what} `{raw}`"))),
    )
}
