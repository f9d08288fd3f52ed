//! Destination-contract scenarios: raw-table landing, rank-dedup merge,
//! metadata invariants.

mod common;

use std::collections::HashMap;

use common::MemoryDestination;
use model::{Record, RecordItems};
use pt::{ColumnDescriptor, ColumnKind, TableSchema};
use value::Value;

fn t_schema() -> TableSchema {
    TableSchema {
        table_identifier: "public.t".to_owned(),
        columns: vec![
            ColumnDescriptor {
                name: "id".to_owned(),
                kind: ColumnKind::Int32,
            },
            ColumnDescriptor {
                name: "v".to_owned(),
                kind: ColumnKind::String,
            },
        ],
        primary_key_columns: vec!["id".to_owned()],
        is_replica_identity_full: false,
    }
}

fn dest() -> MemoryDestination {
    let mut dest = MemoryDestination::default();
    dest.schemas.insert("t".to_owned(), t_schema());
    dest
}

fn items(id: i32, v: &str) -> RecordItems {
    let mut items = RecordItems::new();
    items.insert("id".to_owned(), Value::Integer(id));
    items.insert("v".to_owned(), Value::Text(v.to_owned()));
    items
}

fn insert(checkpoint: i64, id: i32, v: &str) -> Record {
    Record::Insert {
        checkpoint,
        destination_table_name: "t".to_owned(),
        items: items(id, v),
    }
}

fn update(checkpoint: i64, id: i32, old_v: &str, new_v: &str) -> Record {
    Record::Update {
        checkpoint,
        destination_table_name: "t".to_owned(),
        old_items: items(id, old_v),
        new_items: items(id, new_v),
    }
}

fn delete(checkpoint: i64, id: i32, v: &str) -> Record {
    Record::Delete {
        checkpoint,
        destination_table_name: "t".to_owned(),
        items: items(id, v),
    }
}

#[test]
fn insert_update_delete_in_one_batch_leaves_no_row() {
    let mut dest = dest();
    let res = dest.sync_records(&[
        insert(10, 1, "a"),
        update(11, 1, "a", "b"),
        delete(12, 1, "b"),
    ]);
    assert_eq!(res.num_records_synced, 3);
    assert_eq!(res.current_sync_batch_id, 1);

    // raw table carries all three events under one batch id
    assert_eq!(dest.raw.len(), 3);
    assert!(dest.raw.iter().all(|r| r.batch_id == 1));
    assert_eq!(
        dest.raw.iter().map(|r| r.record_type).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let norm = dest.normalize_records(false);
    assert!(norm.done);
    assert!(dest.tables["t"].is_empty());
    assert_eq!(dest.normalize_batch_id(), dest.sync_batch_id());
}

#[test]
fn multi_batch_dedup_keeps_latest_value() {
    let mut dest = dest();
    dest.sync_records(&[insert(10, 1, "a")]);
    dest.sync_records(&[update(20, 1, "a", "b")]);
    // retry of the second batch lands the same raw rows again
    dest.sync_records(&[update(20, 1, "a", "b")]);

    dest.normalize_records(false);
    let table = &dest.tables["t"];
    assert_eq!(table.len(), 1);
    let row = table.values().next().unwrap();
    assert_eq!(row.data.get("v").and_then(|v| v.as_str()), Some("b"));
}

#[test]
fn idempotent_replay_of_sync_and_normalize() {
    let mut once = dest();
    once.sync_records(&[insert(10, 1, "a"), insert(11, 2, "b")]);
    once.normalize_records(false);

    let mut twice = dest();
    twice.sync_records(&[insert(10, 1, "a"), insert(11, 2, "b")]);
    twice.sync_records(&[insert(10, 1, "a"), insert(11, 2, "b")]);
    twice.normalize_records(false);

    assert_eq!(once.tables["t"], twice.tables["t"]);
}

#[test]
fn per_key_last_writer_wins() {
    let mut dest = dest();
    dest.sync_records(&[
        insert(10, 1, "a"),
        update(11, 1, "a", "b"),
        update(12, 1, "b", "c"),
        insert(13, 2, "x"),
        delete(14, 2, "x"),
    ]);
    dest.normalize_records(false);
    let table = &dest.tables["t"];
    assert_eq!(table.len(), 1);
    let row = table.values().next().unwrap();
    assert_eq!(row.data.get("v").and_then(|v| v.as_str()), Some("c"));
}

#[test]
fn soft_delete_marks_row_and_keeps_columns() {
    let mut dest = dest();
    dest.sync_records(&[insert(10, 1, "a")]);
    dest.normalize_records(true);
    dest.sync_records(&[delete(20, 1, "a")]);
    dest.normalize_records(true);

    let table = &dest.tables["t"];
    assert_eq!(table.len(), 1);
    let row = table.values().next().unwrap();
    assert!(row.is_deleted);
    assert_eq!(row.data.get("v").and_then(|v| v.as_str()), Some("a"));
}

#[test]
fn offset_monotonic_and_batch_ids_strictly_increase() {
    let mut dest = dest();
    let mut offsets = Vec::new();
    let mut batch_ids = Vec::new();
    for i in 0..5 {
        let checkpoint = 100 + i * 10;
        let res = dest.sync_records(&[insert(checkpoint, i as i32, "x")]);
        offsets.push(res.last_synced_checkpoint);
        batch_ids.push(res.current_sync_batch_id);
    }
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    assert!(batch_ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn normalize_batch_id_never_exceeds_sync_batch_id() {
    let mut dest = dest();
    assert!(dest.normalize_batch_id() <= dest.sync_batch_id());
    dest.sync_records(&[insert(10, 1, "a")]);
    assert!(dest.normalize_batch_id() <= dest.sync_batch_id());
    dest.sync_records(&[insert(11, 2, "b")]);
    dest.normalize_records(false);
    assert_eq!(dest.normalize_batch_id(), dest.sync_batch_id());

    // normalize with nothing new is a no-op
    let res = dest.normalize_records(false);
    assert!(res.done);
    assert_eq!(dest.normalize_batch_id(), dest.sync_batch_id());
}

#[test]
fn composite_primary_keys_dedup_per_full_key() {
    let mut dest = MemoryDestination::default();
    let mut schema = t_schema();
    schema.primary_key_columns = vec!["id".to_owned(), "v".to_owned()];
    dest.schemas.insert("t".to_owned(), schema);

    dest.sync_records(&[insert(10, 1, "a"), insert(11, 1, "b")]);
    dest.normalize_records(false);
    // same id but different second key component: two rows
    assert_eq!(dest.tables["t"].len(), 2);

    let mut expected = HashMap::new();
    for row in dest.tables["t"].values() {
        expected.insert(
            row.data.get("v").and_then(|v| v.as_str()).unwrap().to_owned(),
            (),
        );
    }
    assert!(expected.contains_key("a") && expected.contains_key("b"));
}
