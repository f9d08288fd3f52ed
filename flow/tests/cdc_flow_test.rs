//! End-to-end CDC choreography against in-memory connectors: setup,
//! pull/sync/normalize, WAL heartbeats on idle, shutdown cleanup.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{MemoryDestination, TestActivities};
use flow::workflows::cdc_flow::CdcFlowWorkflow;
use model::{Record, RecordItems};
use pt::{
    CdcFlowStatus, ColumnDescriptor, ColumnKind, DbType, FlowConnectionConfigs, Peer, PeerConfig,
    PostgresConfig, SnowflakeConfig, TableMapping, TableSchema,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use value::Value;

fn postgres_peer() -> Peer {
    Peer {
        name: "pg".to_owned(),
        r#type: DbType::Postgres,
        config: PeerConfig::Postgres(PostgresConfig {
            host: "localhost".to_owned(),
            port: 5432,
            user: "postgres".to_owned(),
            password: "postgres".to_owned(),
            database: "postgres".to_owned(),
        }),
    }
}

fn snowflake_peer() -> Peer {
    Peer {
        name: "sf".to_owned(),
        r#type: DbType::Snowflake,
        config: PeerConfig::Snowflake(SnowflakeConfig {
            account_id: "acct".to_owned(),
            username: "user".to_owned(),
            private_key: String::new(),
            password: None,
            database: "DB".to_owned(),
            warehouse: "WH".to_owned(),
            role: "R".to_owned(),
            query_timeout: 30,
            s3_integration: String::new(),
        }),
    }
}

fn source_schema() -> TableSchema {
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

fn flow_configs(soft_delete: bool) -> FlowConnectionConfigs {
    FlowConnectionConfigs {
        source: postgres_peer(),
        destination: snowflake_peer(),
        flow_job_name: "cdc_test".to_owned(),
        table_mappings: vec![TableMapping {
            source_table_identifier: "public.t".to_owned(),
            destination_table_identifier: "t".to_owned(),
            partition_key: None,
        }],
        src_table_id_name_mapping: HashMap::new(),
        table_name_schema_mapping: HashMap::new(),
        max_batch_size: 100,
        do_initial_copy: false,
        publication_name: None,
        replication_slot_name: None,
        snapshot_num_rows_per_partition: 0,
        snapshot_max_parallel_workers: 0,
        snapshot_num_tables_in_parallel: 0,
        snapshot_sync_mode: Default::default(),
        snapshot_staging_path: String::new(),
        cdc_sync_mode: Default::default(),
        cdc_staging_path: String::new(),
        soft_delete,
    }
}

fn items(id: i32, v: &str) -> RecordItems {
    let mut items = RecordItems::new();
    items.insert("id".to_owned(), Value::Integer(id));
    items.insert("v".to_owned(), Value::Text(v.to_owned()));
    items
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn cdc_flow_replicates_scripted_batches_and_cleans_up() {
    let dest = Arc::new(Mutex::new(MemoryDestination::default()));
    let activities = Arc::new(TestActivities::new(
        dest.clone(),
        HashMap::from([("public.t".to_owned(), source_schema())]),
    ));

    activities.push_batch(vec![Record::Insert {
        checkpoint: 100,
        destination_table_name: "t".to_owned(),
        items: items(1, "a"),
    }]);
    activities.push_batch(vec![
        Record::Update {
            checkpoint: 110,
            destination_table_name: "t".to_owned(),
            old_items: items(1, "a"),
            new_items: items(1, "b"),
        },
        Record::Insert {
            checkpoint: 111,
            destination_table_name: "t".to_owned(),
            items: items(2, "x"),
        },
    ]);

    let shutdown = CancellationToken::new();
    let status: Arc<RwLock<CdcFlowStatus>> = Default::default();
    let workflow = CdcFlowWorkflow::new(activities.clone(), shutdown.clone(), status.clone());
    let configs = flow_configs(false);
    let handle = tokio::spawn(async move { workflow.run(&configs).await });

    let dest_for_wait = dest.clone();
    wait_until(move || {
        let dest = dest_for_wait.lock().unwrap();
        dest.tables
            .get("t")
            .map(|t| {
                t.len() == 2
                    && t.values()
                        .any(|row| row.data.get("v").and_then(|v| v.as_str()) == Some("b"))
            })
            .unwrap_or(false)
    })
    .await;

    {
        let dest = dest.lock().unwrap();
        assert!(dest.raw_table_created);
        assert!(dest.metadata_tables_created);
        // both batches landed and normalized
        assert_eq!(dest.sync_batch_id(), 2);
        assert_eq!(dest.normalize_batch_id(), 2);
        assert_eq!(dest.get_last_offset().unwrap().checkpoint, 111);
    }
    assert!(status.read().await.setup_complete);
    assert!(!status.read().await.normalize_flow_statuses.is_empty());

    // idle pulls keep the slot alive
    let heartbeats = activities.wal_heartbeats.clone();
    wait_until(move || heartbeats.load(Ordering::SeqCst) > 0).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let dest = dest.lock().unwrap();
    assert!(!dest.raw_table_created, "raw table must be dropped");
    assert!(dest.metadata.is_none(), "metadata row must be deleted");
    let dropped = activities.dropped_objects.lock().unwrap();
    assert!(dropped.iter().any(|d| d == "slot:peerflow_slot_cdc_test"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cdc_flow_leaves_adopted_slot_and_publication_alone() {
    let dest = Arc::new(Mutex::new(MemoryDestination::default()));
    let activities = Arc::new(TestActivities::new(
        dest.clone(),
        HashMap::from([("public.t".to_owned(), source_schema())]),
    ));

    let shutdown = CancellationToken::new();
    let status: Arc<RwLock<CdcFlowStatus>> = Default::default();
    let workflow = CdcFlowWorkflow::new(activities.clone(), shutdown.clone(), status.clone());
    let mut configs = flow_configs(false);
    configs.replication_slot_name = Some("s0".to_owned());
    configs.publication_name = Some("p0".to_owned());
    let handle = tokio::spawn(async move { workflow.run(&configs).await });

    let status_for_wait = status.clone();
    wait_until(move || status_for_wait.try_read().map(|s| s.setup_complete).unwrap_or(false)).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // the flow never created a slot, so cleanup had nothing of its own to
    // drop
    assert!(activities.created_slot.lock().unwrap().is_none());
    let dropped = activities.dropped_objects.lock().unwrap();
    assert!(dropped.iter().all(|d| !d.starts_with("slot:")));
}

#[tokio::test(flavor = "multi_thread")]
async fn cdc_flow_replays_schema_deltas_before_normalizing() {
    let dest = Arc::new(Mutex::new(MemoryDestination::default()));
    let activities = Arc::new(TestActivities::new(
        dest.clone(),
        HashMap::from([("public.t".to_owned(), source_schema())]),
    ));

    activities.push_batch(vec![Record::Insert {
        checkpoint: 100,
        destination_table_name: "t".to_owned(),
        items: items(1, "a"),
    }]);
    // a column appears on the source mid-flow; the next pull reports it
    let mut wide_items = items(2, "x");
    wide_items.insert("c".to_owned(), Value::Integer(5));
    activities.push_batch_with_deltas(
        vec![Record::Insert {
            checkpoint: 110,
            destination_table_name: "t".to_owned(),
            items: wide_items,
        }],
        vec![pt::TableSchemaDelta {
            src_table_name: "public.t".to_owned(),
            dst_table_name: "t".to_owned(),
            added_columns: vec![pt::AddedColumn {
                column_name: "c".to_owned(),
                column_kind: ColumnKind::Int32,
            }],
        }],
    );

    let shutdown = CancellationToken::new();
    let status: Arc<RwLock<CdcFlowStatus>> = Default::default();
    let workflow = CdcFlowWorkflow::new(activities.clone(), shutdown.clone(), status);
    let configs = flow_configs(false);
    let handle = tokio::spawn(async move { workflow.run(&configs).await });

    let dest_for_wait = dest.clone();
    wait_until(move || {
        let dest = dest_for_wait.lock().unwrap();
        dest.tables
            .get("t")
            .map(|t| t.len() == 2)
            .unwrap_or(false)
    })
    .await;

    {
        let dest = dest.lock().unwrap();
        // the destination column set grew
        assert!(dest.schemas["t"].column_kind("c").is_some());
        let wide_row = dest.tables["t"]
            .values()
            .find(|row| row.data.get("id").and_then(|v| v.as_i64()) == Some(2))
            .unwrap();
        assert_eq!(wide_row.data.get("c").and_then(|v| v.as_i64()), Some(5));
        assert_eq!(wide_row.data.get("v").and_then(|v| v.as_str()), Some("x"));
    }

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cdc_flow_soft_delete_marks_rows() {
    let dest = Arc::new(Mutex::new(MemoryDestination::default()));
    let activities = Arc::new(TestActivities::new(
        dest.clone(),
        HashMap::from([("public.t".to_owned(), source_schema())]),
    ));

    activities.push_batch(vec![Record::Insert {
        checkpoint: 100,
        destination_table_name: "t".to_owned(),
        items: items(1, "a"),
    }]);
    activities.push_batch(vec![Record::Delete {
        checkpoint: 101,
        destination_table_name: "t".to_owned(),
        items: items(1, "a"),
    }]);

    let shutdown = CancellationToken::new();
    let status: Arc<RwLock<CdcFlowStatus>> = Default::default();
    let workflow = CdcFlowWorkflow::new(activities.clone(), shutdown.clone(), status);
    let configs = flow_configs(true);
    let handle = tokio::spawn(async move { workflow.run(&configs).await });

    let dest_for_wait = dest.clone();
    wait_until(move || {
        let dest = dest_for_wait.lock().unwrap();
        dest.tables
            .get("t")
            .map(|t| t.values().any(|row| row.is_deleted))
            .unwrap_or(false)
    })
    .await;

    {
        let dest = dest.lock().unwrap();
        let row = dest.tables["t"].values().next().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.data.get("v").and_then(|v| v.as_str()), Some("a"));
    }

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
