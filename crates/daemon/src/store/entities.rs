// entities table: the materialized, queryable view of each live entity.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_json, parse_optional_timestamp, parse_timestamp};

/// A row in the `entities` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: String,
    pub entity_type: String,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub attributes: Value,
    pub local_revision: i64,
    pub server_revision: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl EntityRow {
    /// Display name, if the type carries one.
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").and_then(Value::as_str)
    }
}

const COLUMNS: &str = "id, type, parent_id, root_id, attributes, local_revision, server_revision, \
                       created_at, created_by, updated_at, updated_by";

pub struct EntitiesStore;

impl EntitiesStore {
    pub fn insert(conn: &Connection, row: &EntityRow) -> Result<()> {
        conn.execute(
            "INSERT INTO entities \
             (id, type, parent_id, root_id, attributes, local_revision, server_revision, \
              created_at, created_by, updated_at, updated_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.id,
                row.entity_type,
                row.parent_id,
                row.root_id,
                row.attributes.to_string(),
                row.local_revision,
                row.server_revision,
                row.created_at.to_rfc3339(),
                row.created_by,
                row.updated_at.map(|ts| ts.to_rfc3339()),
                row.updated_by,
            ],
        )
        .with_context(|| format!("failed to insert entity `{}`", row.id))?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<EntityRow>> {
        conn.query_row(&format!("SELECT {COLUMNS} FROM entities WHERE id = ?1"), params![id], row_to_entity)
            .optional()
            .with_context(|| format!("failed to read entity `{id}`"))
    }

    pub fn exists(conn: &Connection, id: &str) -> Result<bool> {
        let count: i64 = conn
            .query_row("SELECT COUNT(1) FROM entities WHERE id = ?1", params![id], |row| row.get(0))
            .with_context(|| format!("failed to check entity `{id}`"))?;
        Ok(count > 0)
    }

    /// Compare-and-swap write of a local edit.
    ///
    /// Succeeds only while `local_revision` still equals `expected_revision`,
    /// and leaves it at `expected_revision + 1`.
    pub fn update_local(
        conn: &Connection,
        id: &str,
        attributes: &Value,
        parent_id: Option<&str>,
        expected_revision: i64,
        updated_at: DateTime<Utc>,
        updated_by: &str,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE entities \
                 SET attributes = ?1, parent_id = ?2, local_revision = local_revision + 1, \
                     updated_at = ?3, updated_by = ?4 \
                 WHERE id = ?5 AND local_revision = ?6",
                params![
                    attributes.to_string(),
                    parent_id,
                    updated_at.to_rfc3339(),
                    updated_by,
                    id,
                    expected_revision
                ],
            )
            .with_context(|| format!("failed to update entity `{id}`"))?;
        Ok(changed > 0)
    }

    /// Overwrite the materialized attributes without touching `local_revision`.
    pub fn replace_attributes(
        conn: &Connection,
        id: &str,
        attributes: &Value,
        parent_id: Option<&str>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE entities SET attributes = ?1, parent_id = ?2 WHERE id = ?3",
                params![attributes.to_string(), parent_id, id],
            )
            .with_context(|| format!("failed to replace attributes of entity `{id}`"))?;
        Ok(changed > 0)
    }

    /// Raise `server_revision` to `revision`; never lowers it.
    pub fn advance_server_revision(conn: &Connection, id: &str, revision: i64) -> Result<()> {
        conn.execute(
            "UPDATE entities SET server_revision = MAX(server_revision, ?1) WHERE id = ?2",
            params![revision, id],
        )
        .with_context(|| format!("failed to advance server revision of entity `{id}`"))?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM entities WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete entity `{id}`"))?;
        Ok(changed > 0)
    }

    pub fn list_children(conn: &Connection, parent_id: &str) -> Result<Vec<EntityRow>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM entities WHERE parent_id = ?1 ORDER BY created_at ASC, id ASC"
            ))
            .context("failed to prepare children query")?;
        let rows = stmt
            .query_map(params![parent_id], row_to_entity)
            .with_context(|| format!("failed to query children of `{parent_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect child entities")
    }

    pub fn list_by_root(conn: &Connection, root_id: &str) -> Result<Vec<EntityRow>> {
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM entities WHERE root_id = ?1 ORDER BY id ASC"))
            .context("failed to prepare root query")?;
        let rows = stmt
            .query_map(params![root_id], row_to_entity)
            .with_context(|| format!("failed to query entities of root `{root_id}`"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect root entities")
    }

    /// Distinct root ids with at least one live entity.
    pub fn list_roots(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare("SELECT DISTINCT root_id FROM entities ORDER BY root_id ASC")
            .context("failed to prepare roots query")?;
        let rows = stmt.query_map([], |row| row.get(0)).context("failed to query roots")?;
        rows.collect::<std::result::Result<Vec<String>, _>>().context("failed to collect roots")
    }

    /// Root-to-node chain ending at `id`, or empty when `id` is unknown.
    pub fn ancestors(conn: &Connection, id: &str) -> Result<Vec<EntityRow>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_owned());
        while let Some(current) = cursor {
            if chain.iter().any(|row: &EntityRow| row.id == current) {
                anyhow::bail!("parent cycle detected at entity `{current}`");
            }
            match Self::get(conn, &current)? {
                Some(row) => {
                    cursor = row.parent_id.clone();
                    chain.push(row);
                }
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
    let attributes: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    Ok(EntityRow {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        parent_id: row.get(2)?,
        root_id: row.get(3)?,
        attributes: parse_json(4, &attributes)?,
        local_revision: row.get(5)?,
        server_revision: row.get(6)?,
        created_at: parse_timestamp(7, &created_at)?,
        created_by: row.get(8)?,
        updated_at: parse_optional_timestamp(9, row.get(9)?)?,
        updated_by: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetaDb;
    use serde_json::json;

    fn row(id: &str, parent_id: Option<&str>) -> EntityRow {
        EntityRow {
            id: id.into(),
            entity_type: if parent_id.is_some() { "folder".into() } else { "space".into() },
            parent_id: parent_id.map(str::to_owned),
            root_id: "space-1".into(),
            attributes: json!({ "type": "folder", "name": id }),
            local_revision: 0,
            server_revision: 0,
            created_at: Utc::now(),
            created_by: "user-1".into(),
            updated_at: None,
            updated_by: None,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let db = MetaDb::open_in_memory().expect("db");
        let entity = row("space-1", None);
        EntitiesStore::insert(db.connection(), &entity).expect("insert");

        let loaded = EntitiesStore::get(db.connection(), "space-1").expect("get").expect("exists");
        assert_eq!(loaded.id, "space-1");
        assert_eq!(loaded.name(), Some("space-1"));
        assert!(EntitiesStore::get(db.connection(), "missing").expect("get").is_none());
    }

    #[test]
    fn update_local_is_guarded_by_revision() {
        let db = MetaDb::open_in_memory().expect("db");
        EntitiesStore::insert(db.connection(), &row("space-1", None)).expect("insert");
        let attrs = json!({ "type": "space", "name": "renamed" });

        assert!(EntitiesStore::update_local(db.connection(), "space-1", &attrs, None, 0, Utc::now(), "u")
            .expect("first write"));
        assert!(!EntitiesStore::update_local(db.connection(), "space-1", &attrs, None, 0, Utc::now(), "u")
            .expect("stale write"));

        let loaded = EntitiesStore::get(db.connection(), "space-1").expect("get").expect("exists");
        assert_eq!(loaded.local_revision, 1);
        assert_eq!(loaded.updated_by.as_deref(), Some("u"));
    }

    #[test]
    fn server_revision_never_decreases() {
        let db = MetaDb::open_in_memory().expect("db");
        EntitiesStore::insert(db.connection(), &row("space-1", None)).expect("insert");
        EntitiesStore::advance_server_revision(db.connection(), "space-1", 7).expect("advance");
        EntitiesStore::advance_server_revision(db.connection(), "space-1", 3).expect("advance");
        let loaded = EntitiesStore::get(db.connection(), "space-1").expect("get").expect("exists");
        assert_eq!(loaded.server_revision, 7);
    }

    #[test]
    fn ancestors_are_root_first() {
        let db = MetaDb::open_in_memory().expect("db");
        EntitiesStore::insert(db.connection(), &row("space-1", None)).expect("space");
        EntitiesStore::insert(db.connection(), &row("folder-1", Some("space-1"))).expect("folder");
        EntitiesStore::insert(db.connection(), &row("folder-2", Some("folder-1"))).expect("nested");

        let chain: Vec<String> = EntitiesStore::ancestors(db.connection(), "folder-2")
            .expect("ancestors")
            .into_iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(chain, vec!["space-1", "folder-1", "folder-2"]);

        let children = EntitiesStore::list_children(db.connection(), "space-1").expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "folder-1");
    }
}
