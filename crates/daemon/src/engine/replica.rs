// Replica of one entity's attributes, backed by a yrs document.
//
// Layout inside the document:
//   "attributes"    map of scalar field -> JSON-encoded value
//   "map:<field>"   map of key -> string, one register per key
//   "text:<field>"  text merged with character splices

use std::collections::BTreeMap;

use loam_common::diff::patch::{apply_patch_ops, diff_to_patch_ops};
use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Map, MapRef, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use super::schema::without_nulls;
use super::{CrdtError, FieldKind, Schema};

const ATTRIBUTES: &str = "attributes";

/// A mergeable copy of one entity's attributes.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create an empty replica with a fixed client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Load a replica from an exported state.
    pub fn from_state(state: &[u8]) -> Result<Self, CrdtError> {
        let replica = Self::new();
        if !state.is_empty() {
            apply(&replica.doc, state).map_err(CrdtError::MalformedState)?;
        }
        Ok(replica)
    }

    /// Load a replica from a compacted state followed by pending deltas.
    pub fn from_parts<'a>(
        state: Option<&[u8]>,
        deltas: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self, CrdtError> {
        let replica = match state {
            Some(state) => Self::from_state(state)?,
            None => Self::new(),
        };
        for delta in deltas {
            replica.apply_delta(delta)?;
        }
        Ok(replica)
    }

    /// Merge a delta produced by any replica. Applying a delta twice is a no-op.
    pub fn apply_delta(&self, delta: &[u8]) -> Result<(), CrdtError> {
        apply(&self.doc, delta).map_err(CrdtError::MalformedDelta)
    }

    /// Encode the full replica state.
    pub fn export_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Mutate the replica toward `target` and return the delta that
    /// reproduces the change elsewhere, or `None` when nothing changed.
    pub fn compute_delta(&self, schema: &Schema, target: &Value) -> Result<Option<Vec<u8>>, CrdtError> {
        schema.validate(target)?;
        let target = target.as_object().map(without_nulls).unwrap_or_default();

        let attributes = self.doc.get_or_insert_map(ATTRIBUTES);
        let maps: Vec<(&str, MapRef)> = schema
            .fields()
            .iter()
            .filter(|field| field.kind == FieldKind::Map)
            .map(|field| (field.name, self.doc.get_or_insert_map(map_root(field.name).as_str())))
            .collect();
        let texts: Vec<(&str, TextRef)> = schema
            .text_fields()
            .map(|name| (name, self.doc.get_or_insert_text(text_root(name).as_str())))
            .collect();

        let before = self.doc.transact().state_vector();
        let mut changed = false;
        {
            let mut txn = self.doc.transact_mut();

            for field in schema.fields().iter().filter(|field| field.kind.is_scalar()) {
                let current = attributes.get(&txn, field.name).map(|out| out.to_string(&txn));
                match target.get(field.name) {
                    Some(value) => {
                        let encoded = value.to_string();
                        if current.as_deref() != Some(encoded.as_str()) {
                            attributes.insert(&mut txn, field.name, encoded);
                            changed = true;
                        }
                    }
                    None if current.is_some() => {
                        attributes.remove(&mut txn, field.name);
                        changed = true;
                    }
                    None => {}
                }
            }

            for (name, map) in &maps {
                let wanted: BTreeMap<String, String> = target
                    .get(*name)
                    .and_then(Value::as_object)
                    .map(|object| {
                        object
                            .iter()
                            .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_owned())))
                            .collect()
                    })
                    .unwrap_or_default();
                let current = read_map(map, &txn);

                for key in current.keys().filter(|key| !wanted.contains_key(*key)) {
                    map.remove(&mut txn, key.as_str());
                    changed = true;
                }
                for (key, value) in &wanted {
                    if current.get(key) != Some(value) {
                        map.insert(&mut txn, key.as_str(), value.clone());
                        changed = true;
                    }
                }
            }

            for (name, text) in &texts {
                let old = text.get_string(&txn);
                let new = target.get(*name).and_then(Value::as_str).unwrap_or_default();
                let ops = diff_to_patch_ops(&old, new);
                if !ops.is_empty() {
                    apply_patch_ops(&mut txn, text, &ops);
                    changed = true;
                }
            }
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(self.doc.transact().encode_diff_v1(&before)))
    }

    /// Project the replica into a plain attribute object.
    ///
    /// Only schema fields are emitted; empty maps and empty text are omitted.
    pub fn materialize(&self, schema: &Schema) -> Result<Value, CrdtError> {
        let attributes = self.doc.get_or_insert_map(ATTRIBUTES);
        let maps: Vec<(&str, MapRef)> = schema
            .fields()
            .iter()
            .filter(|field| field.kind == FieldKind::Map)
            .map(|field| (field.name, self.doc.get_or_insert_map(map_root(field.name).as_str())))
            .collect();
        let texts: Vec<(&str, TextRef)> = schema
            .text_fields()
            .map(|name| (name, self.doc.get_or_insert_text(text_root(name).as_str())))
            .collect();

        let txn = self.doc.transact();
        let mut object = JsonMap::new();

        for field in schema.fields().iter().filter(|field| field.kind.is_scalar()) {
            if let Some(raw) = attributes.get(&txn, field.name).map(|out| out.to_string(&txn)) {
                let value: Value = serde_json::from_str(&raw).map_err(|err| {
                    CrdtError::MalformedState(format!("field `{}` holds invalid JSON: {err}", field.name))
                })?;
                object.insert(field.name.to_owned(), value);
            }
        }

        for (name, map) in &maps {
            let entries = read_map(map, &txn);
            if !entries.is_empty() {
                let entries = entries.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
                object.insert((*name).to_owned(), Value::Object(entries));
            }
        }

        for (name, text) in &texts {
            let content = text.get_string(&txn);
            if !content.is_empty() {
                object.insert((*name).to_owned(), Value::String(content));
            }
        }

        Ok(Value::Object(object))
    }

    /// Materialize and deserialize into a typed attribute struct.
    pub fn materialize_as<T: DeserializeOwned>(&self, schema: &Schema) -> Result<T, CrdtError> {
        let value = self.materialize(schema)?;
        serde_json::from_value(value).map_err(|err| CrdtError::MalformedState(err.to_string()))
    }

    /// The `type` tag stored in the replica, readable before a schema is known.
    pub fn type_tag(&self) -> Result<Option<String>, CrdtError> {
        let attributes = self.doc.get_or_insert_map(ATTRIBUTES);
        let txn = self.doc.transact();
        let Some(raw) = attributes.get(&txn, "type").map(|out| out.to_string(&txn)) else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| CrdtError::MalformedState(format!("field `type` holds invalid JSON: {err}")))?;
        Ok(value.as_str().map(str::to_owned))
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(doc: &Doc, data: &[u8]) -> Result<(), String> {
    let update = Update::decode_v1(data).map_err(|err| err.to_string())?;
    doc.transact_mut().apply_update(update).map_err(|err| err.to_string())
}

fn read_map<T: ReadTxn>(map: &MapRef, txn: &T) -> BTreeMap<String, String> {
    map.iter(txn).map(|(key, out)| (key.to_owned(), out.to_string(txn))).collect()
}

fn map_root(field: &str) -> String {
    format!("map:{field}")
}

fn text_root(field: &str) -> String {
    format!("text:{field}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FieldSpec;
    use serde_json::json;

    const FIELDS: &[FieldSpec] = &[
        FieldSpec::required("type", FieldKind::String),
        FieldSpec::required("name", FieldKind::String),
        FieldSpec::optional("size", FieldKind::Number),
        FieldSpec::optional("collaborators", FieldKind::Map),
        FieldSpec::optional("body", FieldKind::Text),
    ];
    const SCHEMA: Schema = Schema::new(FIELDS);

    fn sync(from: &Replica, to: &Replica) {
        to.apply_delta(&from.export_state()).expect("apply state");
    }

    #[test]
    fn create_then_materialize() {
        let replica = Replica::with_client_id(1);
        let attrs = json!({ "type": "page", "name": "Notes", "body": "hello" });
        let delta = replica.compute_delta(&SCHEMA, &attrs).expect("valid");
        assert!(delta.is_some());
        assert_eq!(replica.materialize(&SCHEMA).expect("materialize"), attrs);
    }

    #[test]
    fn type_tag_is_readable_without_a_schema() {
        let replica = Replica::with_client_id(1);
        assert_eq!(replica.type_tag().expect("empty"), None);
        let delta = replica
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "Notes" }))
            .expect("valid")
            .expect("delta");
        let remote = Replica::new();
        remote.apply_delta(&delta).expect("apply");
        assert_eq!(remote.type_tag().expect("tag").as_deref(), Some("page"));
    }

    #[test]
    fn unchanged_target_produces_no_delta() {
        let replica = Replica::with_client_id(1);
        let attrs = json!({ "type": "page", "name": "Notes" });
        replica.compute_delta(&SCHEMA, &attrs).expect("create");
        assert_eq!(replica.compute_delta(&SCHEMA, &attrs).expect("touch"), None);
    }

    #[test]
    fn invalid_target_leaves_replica_untouched() {
        let replica = Replica::with_client_id(1);
        replica.compute_delta(&SCHEMA, &json!({ "type": "page", "name": "a" })).expect("create");
        let before = replica.export_state();

        let err = replica.compute_delta(&SCHEMA, &json!({ "type": "page" })).expect_err("invalid");
        assert!(matches!(err, CrdtError::InvalidAttributes(_)));
        assert_eq!(replica.export_state(), before);
    }

    #[test]
    fn removing_an_optional_field_is_a_change() {
        let replica = Replica::with_client_id(1);
        replica
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "a", "size": 3 }))
            .expect("create");

        let remote = Replica::with_client_id(2);
        sync(&replica, &remote);

        let delta = replica
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "a" }))
            .expect("update")
            .expect("field removal produces a delta");
        remote.apply_delta(&delta).expect("apply");
        assert_eq!(remote.materialize(&SCHEMA).expect("materialize"), json!({ "type": "page", "name": "a" }));
    }

    #[test]
    fn delta_replays_on_another_replica() {
        let local = Replica::with_client_id(1);
        let remote = Replica::with_client_id(2);

        let create = local
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "a" }))
            .expect("create")
            .expect("delta");
        remote.apply_delta(&create).expect("apply create");

        let rename = local
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "b" }))
            .expect("rename")
            .expect("delta");
        remote.apply_delta(&rename).expect("apply rename");
        remote.apply_delta(&rename).expect("apply twice");

        assert_eq!(remote.materialize(&SCHEMA).expect("materialize"), json!({ "type": "page", "name": "b" }));
    }

    #[test]
    fn concurrent_map_keys_both_survive() {
        let a = Replica::with_client_id(1);
        a.compute_delta(&SCHEMA, &json!({ "type": "space", "name": "s" })).expect("create");
        let b = Replica::from_state(&a.export_state()).expect("load");

        let da = a
            .compute_delta(&SCHEMA, &json!({ "type": "space", "name": "s", "collaborators": { "u1": "admin" } }))
            .expect("a")
            .expect("delta");
        let db = b
            .compute_delta(&SCHEMA, &json!({ "type": "space", "name": "s", "collaborators": { "u2": "viewer" } }))
            .expect("b")
            .expect("delta");
        a.apply_delta(&db).expect("merge b");
        b.apply_delta(&da).expect("merge a");

        let expected = json!({ "u1": "admin", "u2": "viewer" });
        assert_eq!(a.materialize(&SCHEMA).expect("a")["collaborators"], expected);
        assert_eq!(b.materialize(&SCHEMA).expect("b")["collaborators"], expected);
    }

    #[test]
    fn concurrent_text_edits_merge() {
        let a = Replica::with_client_id(1);
        a.compute_delta(&SCHEMA, &json!({ "type": "page", "name": "p", "body": "hello" })).expect("create");
        let b = Replica::from_state(&a.export_state()).expect("load");

        let da = a
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "p", "body": "hello world" }))
            .expect("a")
            .expect("delta");
        let db = b
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "p", "body": "Oh, hello" }))
            .expect("b")
            .expect("delta");
        a.apply_delta(&db).expect("merge b");
        b.apply_delta(&da).expect("merge a");

        let body_a = a.materialize(&SCHEMA).expect("a")["body"].clone();
        assert_eq!(body_a, b.materialize(&SCHEMA).expect("b")["body"]);
        assert_eq!(body_a, json!("Oh, hello world"));
    }

    #[test]
    fn empty_text_and_maps_are_omitted() {
        let replica = Replica::with_client_id(1);
        replica
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "p", "body": "", "collaborators": {} }))
            .expect("create");
        assert_eq!(replica.materialize(&SCHEMA).expect("materialize"), json!({ "type": "page", "name": "p" }));
    }

    #[test]
    fn from_parts_replays_pending_deltas() {
        let source = Replica::with_client_id(1);
        source.compute_delta(&SCHEMA, &json!({ "type": "page", "name": "a" })).expect("create");
        let state = source.export_state();
        let rename = source
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "b" }))
            .expect("rename")
            .expect("delta");

        let loaded = Replica::from_parts(Some(&state), [rename.as_slice()]).expect("load");
        assert_eq!(loaded.materialize(&SCHEMA).expect("materialize")["name"], json!("b"));
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert!(matches!(Replica::from_state(b"not a valid state"), Err(CrdtError::MalformedState(_))));
        let replica = Replica::new();
        assert!(matches!(replica.apply_delta(b"not a valid update"), Err(CrdtError::MalformedDelta(_))));
    }

    #[test]
    fn typed_materialization() {
        #[derive(serde::Deserialize)]
        struct Page {
            name: String,
            size: Option<u64>,
        }

        let replica = Replica::with_client_id(1);
        replica
            .compute_delta(&SCHEMA, &json!({ "type": "page", "name": "typed", "size": 12 }))
            .expect("create");
        let page: Page = replica.materialize_as(&SCHEMA).expect("typed");
        assert_eq!(page.name, "typed");
        assert_eq!(page.size, Some(12));
    }
}
