// cursors table: last applied remote revision per root and change kind.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use loam_common::protocol::sync::ChangeKind;
use rusqlite::{params, Connection, OptionalExtension};

pub struct CursorStore;

impl CursorStore {
    pub fn key(root_id: &str, kind: ChangeKind) -> String {
        format!("{root_id}:{}", kind.as_str())
    }

    /// Stored watermark, or 0 when the stream was never pulled.
    pub fn get(conn: &Connection, root_id: &str, kind: ChangeKind) -> Result<i64> {
        let key = Self::key(root_id, kind);
        let revision: Option<i64> = conn
            .query_row("SELECT revision FROM cursors WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .with_context(|| format!("failed to read cursor `{key}`"))?;
        Ok(revision.unwrap_or(0))
    }

    /// Move the watermark forward; a lower revision is ignored.
    pub fn advance(conn: &Connection, root_id: &str, kind: ChangeKind, revision: i64, now: DateTime<Utc>) -> Result<()> {
        let key = Self::key(root_id, kind);
        conn.execute(
            "INSERT INTO cursors (key, revision, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET revision = excluded.revision, updated_at = excluded.updated_at \
             WHERE excluded.revision > cursors.revision",
            params![key, revision, now.to_rfc3339()],
        )
        .with_context(|| format!("failed to advance cursor `{key}`"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaDb;

    #[test]
    fn cursor_defaults_to_zero_and_only_advances() {
        let db = MetaDb::open_in_memory().expect("db");
        let conn = db.connection();
        assert_eq!(CursorStore::get(conn, "space-1", ChangeKind::EntityUpdates).expect("get"), 0);

        CursorStore::advance(conn, "space-1", ChangeKind::EntityUpdates, 7, Utc::now()).expect("advance");
        CursorStore::advance(conn, "space-1", ChangeKind::EntityUpdates, 5, Utc::now()).expect("stale");
        assert_eq!(CursorStore::get(conn, "space-1", ChangeKind::EntityUpdates).expect("get"), 7);
        assert_eq!(CursorStore::get(conn, "space-1", ChangeKind::Tombstones).expect("get"), 0);
        assert_eq!(CursorStore::key("space-1", ChangeKind::Tombstones), "space-1:tombstones");
    }
}
