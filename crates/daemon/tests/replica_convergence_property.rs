use std::collections::BTreeMap;

use loam_daemon::engine::Replica;
use loam_daemon::model::{EntityModel, PageModel, SpaceModel};
use proptest::prelude::*;
use serde_json::{json, Value};

static PAGE: PageModel = PageModel;
static SPACE: SpaceModel = SpaceModel;

#[derive(Debug, Clone)]
struct PageEdit {
    name: Option<String>,
    insert_at: usize,
    insert: String,
    delete_at: usize,
    delete_len: usize,
}

fn page_edit() -> impl Strategy<Value = PageEdit> {
    (
        proptest::option::of("[a-z]{1,8}"),
        0usize..64,
        "[a-z ]{0,6}",
        0usize..64,
        0usize..4,
    )
        .prop_map(|(name, insert_at, insert, delete_at, delete_len)| PageEdit {
            name,
            insert_at,
            insert,
            delete_at,
            delete_len,
        })
}

fn apply_edit(current: &Value, edit: &PageEdit) -> Value {
    let mut next = current.clone();
    if let Some(name) = &edit.name {
        next["name"] = json!(name);
    }
    let mut body: Vec<char> = current.get("body").and_then(Value::as_str).unwrap_or_default().chars().collect();
    let at = edit.delete_at % (body.len() + 1);
    let end = (at + edit.delete_len).min(body.len());
    body.drain(at..end);
    let at = edit.insert_at % (body.len() + 1);
    for (offset, ch) in edit.insert.chars().enumerate() {
        body.insert(at + offset, ch);
    }
    let body: String = body.into_iter().collect();
    match next.as_object_mut() {
        Some(object) if body.is_empty() => {
            object.remove("body");
        }
        Some(object) => {
            object.insert("body".into(), json!(body));
        }
        None => {}
    }
    next
}

fn base_page() -> (Replica, Vec<u8>) {
    let replica = Replica::with_client_id(1);
    let delta = replica
        .compute_delta(PAGE.schema(), &json!({ "type": "page", "parent_id": "space-1", "name": "Plan", "body": "shared draft" }))
        .expect("valid base")
        .expect("base delta");
    (replica, delta)
}

fn fork(base: &[u8], client_id: u64) -> Replica {
    let replica = Replica::with_client_id(client_id);
    replica.apply_delta(base).expect("base applies");
    replica
}

/// Run `edits` on `replica`, returning the deltas produced.
fn edit_all(replica: &Replica, edits: &[PageEdit]) -> Vec<Vec<u8>> {
    let schema = PAGE.schema();
    let mut deltas = Vec::new();
    for edit in edits {
        let current = replica.materialize(schema).expect("materialize");
        let target = apply_edit(&current, edit);
        if let Some(delta) = replica.compute_delta(schema, &target).expect("valid edit") {
            deltas.push(delta);
        }
    }
    deltas
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn concurrent_edits_converge_in_any_order(
        left_edits in proptest::collection::vec(page_edit(), 1..6),
        right_edits in proptest::collection::vec(page_edit(), 1..6),
    ) {
        let (_, base) = base_page();
        let left = fork(&base, 2);
        let right = fork(&base, 3);
        let left_deltas = edit_all(&left, &left_edits);
        let right_deltas = edit_all(&right, &right_edits);

        for delta in &right_deltas {
            left.apply_delta(delta).expect("right delta applies on left");
        }
        for delta in &left_deltas {
            right.apply_delta(delta).expect("left delta applies on right");
        }

        // A third replica sees the right side first, and one delta twice.
        let observer = fork(&base, 4);
        let mut all: Vec<&Vec<u8>> = right_deltas.iter().chain(left_deltas.iter()).collect();
        all.extend(left_deltas.iter().take(1));
        for delta in all {
            observer.apply_delta(delta).expect("delta applies on observer");
        }

        let schema = PAGE.schema();
        let merged = left.materialize(schema).expect("left");
        prop_assert_eq!(&merged, &right.materialize(schema).expect("right"));
        prop_assert_eq!(&merged, &observer.materialize(schema).expect("observer"));
    }

    #[test]
    fn reapplying_deltas_is_idempotent(edits in proptest::collection::vec(page_edit(), 1..8)) {
        let (_, base) = base_page();
        let author = fork(&base, 2);
        let deltas = edit_all(&author, &edits);

        let replica = fork(&base, 3);
        for delta in deltas.iter().chain(deltas.iter()) {
            replica.apply_delta(delta).expect("delta applies");
        }
        replica.apply_delta(&author.export_state()).expect("full state applies");

        let schema = PAGE.schema();
        prop_assert_eq!(replica.materialize(schema).expect("replica"), author.materialize(schema).expect("author"));
    }

    #[test]
    fn concurrent_grants_of_different_collaborators_all_survive(
        left in proptest::collection::btree_map("[a-m]{3}", prop_oneof!["viewer", "editor", "admin"], 1..4),
        right in proptest::collection::btree_map("[n-z]{3}", prop_oneof!["viewer", "editor", "admin"], 1..4),
    ) {
        let schema = SPACE.schema();
        let origin = Replica::with_client_id(1);
        let base = origin
            .compute_delta(schema, &json!({ "type": "space", "name": "Team" }))
            .expect("valid")
            .expect("delta");

        let grant = |replica: &Replica, grants: &BTreeMap<String, String>| {
            let mut target = replica.materialize(schema).expect("materialize");
            target["collaborators"] = json!(grants);
            replica.compute_delta(schema, &target).expect("valid grant").expect("grant delta")
        };
        let a = fork(&base, 2);
        let b = fork(&base, 3);
        let from_a = grant(&a, &left);
        let from_b = grant(&b, &right);
        a.apply_delta(&from_b).expect("apply");
        b.apply_delta(&from_a).expect("apply");

        let merged = a.materialize(schema).expect("merged");
        prop_assert_eq!(&merged, &b.materialize(schema).expect("merged"));
        let collaborators = merged["collaborators"].as_object().expect("collaborators").len();
        prop_assert_eq!(collaborators, left.len() + right.len());
    }
}
