use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE entities (
    id                  TEXT PRIMARY KEY,
    type                TEXT NOT NULL,
    parent_id           TEXT NULL,
    root_id             TEXT NOT NULL,
    attributes          TEXT NOT NULL,
    local_revision      INTEGER NOT NULL DEFAULT 0,
    server_revision     INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    created_by          TEXT NOT NULL,
    updated_at          TEXT NULL,
    updated_by          TEXT NULL
);

CREATE INDEX entities_parent_idx ON entities (parent_id);
CREATE INDEX entities_root_idx ON entities (root_id);

CREATE TABLE entity_states (
    id                  TEXT PRIMARY KEY,
    state               BLOB NOT NULL,
    revision            INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE entity_deltas (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    delta_id            TEXT NOT NULL UNIQUE,
    entity_id           TEXT NOT NULL,
    root_id             TEXT NOT NULL,
    data                BLOB NOT NULL,
    created_at          TEXT NOT NULL,
    created_by          TEXT NOT NULL,
    mutation_id         TEXT NOT NULL
);

CREATE INDEX entity_deltas_entity_idx ON entity_deltas (entity_id, seq);

CREATE TABLE mutations (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  TEXT NOT NULL UNIQUE,
    type                TEXT NOT NULL,
    entity_id           TEXT NOT NULL,
    data                TEXT NOT NULL,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'failed')),
    last_error          TEXT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE tombstones (
    id                  TEXT PRIMARY KEY,
    root_id             TEXT NOT NULL,
    data                TEXT NOT NULL,
    deleted_at          TEXT NOT NULL,
    deleted_by          TEXT NOT NULL,
    origin              TEXT NOT NULL CHECK (origin IN ('local', 'remote')),
    revision            INTEGER NULL
);

CREATE TABLE collaborations (
    entity_id           TEXT NOT NULL,
    collaborator_id     TEXT NOT NULL,
    role                TEXT NOT NULL,
    revision            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NULL,
    deleted_at          TEXT NULL,
    PRIMARY KEY (entity_id, collaborator_id)
);

CREATE INDEX collaborations_collaborator_idx ON collaborations (collaborator_id);

CREATE TABLE entity_references (
    entity_id           TEXT NOT NULL,
    target_id           TEXT NOT NULL,
    kind                TEXT NOT NULL,
    PRIMARY KEY (entity_id, target_id, kind)
);

CREATE INDEX entity_references_target_idx ON entity_references (target_id);

CREATE TABLE cursors (
    key                 TEXT PRIMARY KEY,
    revision            INTEGER NOT NULL,
    updated_at          TEXT NOT NULL
);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE reactions (
    entity_id           TEXT NOT NULL,
    collaborator_id     TEXT NOT NULL,
    reaction            TEXT NOT NULL,
    root_id             TEXT NOT NULL,
    revision            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    deleted_at          TEXT NULL,
    PRIMARY KEY (entity_id, collaborator_id, reaction)
);

CREATE TABLE interactions (
    entity_id           TEXT NOT NULL,
    collaborator_id     TEXT NOT NULL,
    root_id             TEXT NOT NULL,
    first_seen_at       TEXT NULL,
    last_seen_at        TEXT NULL,
    last_opened_at      TEXT NULL,
    revision            INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (entity_id, collaborator_id)
);

CREATE TABLE counters (
    entity_id           TEXT NOT NULL,
    kind                TEXT NOT NULL,
    value               INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (entity_id, kind)
);

CREATE TABLE file_states (
    id                  TEXT PRIMARY KEY,
    upload_status       TEXT NOT NULL,
    upload_progress     INTEGER NOT NULL DEFAULT 0,
    upload_error        TEXT NULL,
    download_status     TEXT NOT NULL,
    download_progress   INTEGER NOT NULL DEFAULT 0,
    updated_at          TEXT NOT NULL
);

CREATE VIRTUAL TABLE entity_texts USING fts5(
    id UNINDEXED,
    name,
    text,
    tokenize = 'unicode61'
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

#[derive(Debug)]
pub struct MetaDb {
    conn: Connection,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at `{}`", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open a transaction.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
