#![allow(dead_code)]
//! In-memory source and destination used to drive the CDC and QRep
//! choreography end-to-end. The destination mirrors the raw-table +
//! merge contract: append-only raw rows, rank-dedup per primary key,
//! metadata advanced transactionally with the writes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flow::activities::{CheckConnectionResult, FlowActivities};
use flow::orchestrator::ActivityContext;
use model::{
    NormalizeResponse, QRecord, Record, SyncResponse,
};
use pt::{
    CreateRawTableInput, CreateRawTableOutput, EnsurePullabilityInput, EnsurePullabilityOutput,
    GetTableSchemaInput, LastSyncState, PartitionRange, Peer, QRepConfig, QRepPartition,
    QRepPartitionBatch, ReplayTableSchemaDeltaInput, SetupNormalizedTableInput,
    SetupNormalizedTableOutput, SetupReplicationInput, SetupReplicationOutput, ShutdownRequest,
    StartFlowInput, StartNormalizeInput, TableSchema, TableSchemaDelta,
};
use value::Value;

#[derive(Debug, Clone)]
pub struct RawRow {
    pub uid: u64,
    pub timestamp: u64,
    pub dest_table: String,
    pub data: serde_json::Value,
    pub record_type: i32,
    pub match_data: Option<serde_json::Value>,
    pub batch_id: i64,
}

/// Normalized destination row: column values plus the soft-delete marker.
#[derive(Debug, Clone, PartialEq)]
pub struct DestRow {
    pub data: serde_json::Value,
    pub is_deleted: bool,
}

#[derive(Default)]
pub struct MemoryDestination {
    pub raw: Vec<RawRow>,
    pub metadata: Option<(i64, i64, i64)>, // offset, sync_batch_id, normalize_batch_id
    pub tables: HashMap<String, BTreeMap<String, DestRow>>,
    pub schemas: HashMap<String, TableSchema>,
    pub raw_table_created: bool,
    pub metadata_tables_created: bool,
    pub qrep_tables: HashMap<String, Vec<QRecord>>,
    pub synced_partitions: HashSet<String>,
    pub consolidated: bool,
    pub qrep_cleaned_up: bool,
    uid_counter: u64,
    ts_counter: u64,
}

fn items_to_json(items: &HashMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        items
            .iter()
            .map(|(k, v)| (k.clone(), v.to_serde_json_value()))
            .collect(),
    )
}

impl MemoryDestination {
    pub fn get_last_offset(&self) -> Option<LastSyncState> {
        match self.metadata {
            Some((offset, _, _)) if offset != 0 => Some(LastSyncState { checkpoint: offset }),
            _ => None,
        }
    }

    pub fn sync_batch_id(&self) -> i64 {
        self.metadata.map(|(_, sync, _)| sync).unwrap_or(0)
    }

    pub fn normalize_batch_id(&self) -> i64 {
        self.metadata.map(|(_, _, norm)| norm).unwrap_or(0)
    }

    /// Land records in the raw table and advance sync metadata, mirroring
    /// the destination contract: uid per row, monotonic timestamps, all
    /// rows of one call under one batch id.
    pub fn sync_records(&mut self, records: &[Record]) -> SyncResponse {
        if records.is_empty() {
            return SyncResponse::default();
        }
        let sync_batch_id = self.sync_batch_id() + 1;
        let first_cp = records.first().map(|r| r.checkpoint()).unwrap_or(0);
        let last_cp = records.iter().map(|r| r.checkpoint()).max().unwrap_or(0);

        let mut table_name_rows_mapping: HashMap<String, u32> = HashMap::new();
        for record in records {
            self.uid_counter += 1;
            self.ts_counter += 1;
            let (dest_table, data, record_type, match_data) = match record {
                Record::Insert {
                    destination_table_name,
                    items,
                    ..
                } => (destination_table_name, items_to_json(items), 0, None),
                Record::Update {
                    destination_table_name,
                    old_items,
                    new_items,
                    ..
                } => (
                    destination_table_name,
                    items_to_json(new_items),
                    1,
                    Some(items_to_json(old_items)),
                ),
                Record::Delete {
                    destination_table_name,
                    items,
                    ..
                } => (
                    destination_table_name,
                    items_to_json(items),
                    2,
                    Some(items_to_json(items)),
                ),
            };
            self.raw.push(RawRow {
                uid: self.uid_counter,
                timestamp: self.ts_counter,
                dest_table: dest_table.clone(),
                data,
                record_type,
                match_data,
                batch_id: sync_batch_id,
            });
            *table_name_rows_mapping.entry(dest_table.clone()).or_insert(0) += 1;
        }

        let normalize_batch_id = self.normalize_batch_id();
        self.metadata = Some((last_cp, sync_batch_id, normalize_batch_id));

        SyncResponse {
            first_synced_checkpoint: first_cp,
            last_synced_checkpoint: last_cp,
            num_records_synced: records.len() as u64,
            current_sync_batch_id: sync_batch_id,
            table_name_rows_mapping,
            table_schema_deltas: vec![],
            relation_message_mapping: HashMap::new(),
        }
    }

    /// Merge the raw-table window into the normalized tables: keep only
    /// the latest event per primary key (timestamp then uid), then
    /// insert/update/delete or mark soft-deleted.
    pub fn normalize_records(&mut self, soft_delete: bool) -> NormalizeResponse {
        let Some((offset, sync_batch_id, normalize_batch_id)) = self.metadata else {
            return NormalizeResponse {
                done: true,
                ..Default::default()
            };
        };
        if sync_batch_id == normalize_batch_id {
            return NormalizeResponse {
                done: true,
                start_batch_id: normalize_batch_id,
                end_batch_id: sync_batch_id,
            };
        }

        let window: Vec<RawRow> = self
            .raw
            .iter()
            .filter(|r| r.batch_id > normalize_batch_id && r.batch_id <= sync_batch_id)
            .cloned()
            .collect();

        let mut winners: HashMap<(String, String), RawRow> = HashMap::new();
        for row in window {
            let schema = self
                .schemas
                .get(&row.dest_table)
                .expect("schema must be initialized before normalize");
            let match_source = if row.record_type == 0 {
                &row.data
            } else {
                row.match_data.as_ref().unwrap_or(&row.data)
            };
            // primary key values come from the post-image for inserts and
            // updates (key columns do not change), pre-image for deletes
            let key_source = if row.record_type == 2 {
                match_source
            } else {
                &row.data
            };
            let pk = pk_key(schema, key_source);
            let entry = winners.entry((row.dest_table.clone(), pk));
            match entry {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let current = occupied.get();
                    if (row.timestamp, row.uid) > (current.timestamp, current.uid) {
                        occupied.insert(row);
                    }
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(row);
                }
            }
        }

        for ((dest_table, pk), winner) in winners {
            let table = self.tables.entry(dest_table).or_default();
            if winner.record_type == 2 {
                if soft_delete {
                    if let Some(existing) = table.get_mut(&pk) {
                        existing.is_deleted = true;
                    }
                } else {
                    table.remove(&pk);
                }
            } else {
                table.insert(
                    pk,
                    DestRow {
                        data: winner.data,
                        is_deleted: false,
                    },
                );
            }
        }

        self.metadata = Some((offset, sync_batch_id, sync_batch_id));
        NormalizeResponse {
            done: true,
            start_batch_id: normalize_batch_id + 1,
            end_batch_id: sync_batch_id,
        }
    }

    pub fn sync_flow_cleanup(&mut self) {
        self.raw.clear();
        self.metadata = None;
        self.raw_table_created = false;
    }
}

fn pk_key(schema: &TableSchema, data: &serde_json::Value) -> String {
    schema
        .primary_key_columns
        .iter()
        .map(|pk| data.get(pk).map(|v| v.to_string()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

/// Scripted QRep source: integer ids in the watermark table.
#[derive(Default)]
pub struct MemoryQRepSource {
    pub rows: Vec<i64>,
}

impl MemoryQRepSource {
    /// Partition `(last_end, max]` into disjoint inclusive ranges of at
    /// most `num_rows_per_partition` rows, in increasing order.
    pub fn get_partitions(
        &self,
        num_rows_per_partition: u32,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> Vec<QRepPartition> {
        let last_end = match last {
            Some(QRepPartition {
                range: PartitionRange::Int { end, .. },
                ..
            }) => *end,
            _ => i64::MIN,
        };
        let mut pending: Vec<i64> = self.rows.iter().copied().filter(|id| *id > last_end).collect();
        pending.sort_unstable();
        pending
            .chunks(num_rows_per_partition.max(1) as usize)
            .enumerate()
            .map(|(idx, chunk)| QRepPartition {
                partition_id: format!("{}-part-{}", run_uuid, idx),
                range: PartitionRange::Int {
                    start: *chunk.first().expect("chunk is non-empty"),
                    end: *chunk.last().expect("chunk is non-empty"),
                },
                run_uuid: run_uuid.to_owned(),
            })
            .collect()
    }

    pub fn rows_in_range(&self, range: &PartitionRange) -> Vec<i64> {
        match range {
            PartitionRange::Int { start, end } => self
                .rows
                .iter()
                .copied()
                .filter(|id| id >= start && id <= end)
                .collect(),
            PartitionRange::FullTable => self.rows.clone(),
            _ => vec![],
        }
    }
}

/// Activity implementation wired to the in-memory stores. The CDC source
/// is a queue of scripted batches; an exhausted queue yields empty pulls.
pub struct TestActivities {
    pub dest: Arc<Mutex<MemoryDestination>>,
    pub cdc_batches: Arc<Mutex<VecDeque<(Vec<Record>, Vec<TableSchemaDelta>)>>>,
    pub qrep_source: Arc<Mutex<MemoryQRepSource>>,
    pub source_schemas: HashMap<String, TableSchema>,
    pub wal_heartbeats: Arc<AtomicU32>,
    pub dropped_objects: Arc<Mutex<Vec<String>>>,
    pub created_slot: Arc<Mutex<Option<String>>>,
    run_counter: AtomicU64,
}

impl TestActivities {
    pub fn new(
        dest: Arc<Mutex<MemoryDestination>>,
        source_schemas: HashMap<String, TableSchema>,
    ) -> Self {
        Self {
            dest,
            cdc_batches: Arc::new(Mutex::new(VecDeque::new())),
            qrep_source: Arc::new(Mutex::new(MemoryQRepSource::default())),
            source_schemas,
            wal_heartbeats: Arc::new(AtomicU32::new(0)),
            dropped_objects: Arc::new(Mutex::new(Vec::new())),
            created_slot: Arc::new(Mutex::new(None)),
            run_counter: AtomicU64::new(0),
        }
    }

    pub fn push_batch(&self, records: Vec<Record>) {
        self.cdc_batches.lock().unwrap().push_back((records, vec![]));
    }

    /// A batch whose pull also observed relation changes on the source.
    pub fn push_batch_with_deltas(&self, records: Vec<Record>, deltas: Vec<TableSchemaDelta>) {
        self.cdc_batches.lock().unwrap().push_back((records, deltas));
    }
}

#[async_trait::async_trait]
impl FlowActivities for TestActivities {
    async fn check_connection(&self, _peer: &Peer) -> anyhow::Result<CheckConnectionResult> {
        Ok(CheckConnectionResult {
            needs_setup_metadata_tables: !self.dest.lock().unwrap().metadata_tables_created,
        })
    }

    async fn setup_metadata_tables(&self, _peer: &Peer) -> anyhow::Result<()> {
        self.dest.lock().unwrap().metadata_tables_created = true;
        Ok(())
    }

    async fn get_last_synced_id(
        &self,
        _peer: &Peer,
        _flow_job_name: &str,
    ) -> anyhow::Result<Option<LastSyncState>> {
        Ok(self.dest.lock().unwrap().get_last_offset())
    }

    async fn ensure_pullability(
        &self,
        input: &EnsurePullabilityInput,
    ) -> anyhow::Result<EnsurePullabilityOutput> {
        let table_identifier_mapping = input
            .source_table_identifiers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), (idx + 1) as u32))
            .collect();
        Ok(EnsurePullabilityOutput {
            table_identifier_mapping,
        })
    }

    async fn get_table_schema(
        &self,
        input: &GetTableSchemaInput,
    ) -> anyhow::Result<HashMap<String, TableSchema>> {
        Ok(input
            .table_identifiers
            .iter()
            .filter_map(|name| {
                self.source_schemas
                    .get(name)
                    .map(|schema| (name.clone(), schema.clone()))
            })
            .collect())
    }

    async fn setup_replication(
        &self,
        input: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput> {
        match input.existing_replication_slot_name.as_deref() {
            Some(name) if !name.is_empty() => Ok(SetupReplicationOutput {
                slot_name: name.to_owned(),
                snapshot_name: String::new(),
                consistent_point: 1,
            }),
            _ => {
                let slot_name = format!("peerflow_slot_{}", input.flow_job_name);
                *self.created_slot.lock().unwrap() = Some(slot_name.clone());
                Ok(SetupReplicationOutput {
                    slot_name,
                    snapshot_name: "snapshot_0001".to_owned(),
                    consistent_point: 1,
                })
            }
        }
    }

    async fn create_raw_table(
        &self,
        input: &CreateRawTableInput,
    ) -> anyhow::Result<CreateRawTableOutput> {
        self.dest.lock().unwrap().raw_table_created = true;
        Ok(CreateRawTableOutput {
            table_identifier: format!("_PEERDB_RAW_{}", input.flow_job_name),
        })
    }

    async fn create_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput> {
        let mut dest = self.dest.lock().unwrap();
        let mut table_exists_mapping = HashMap::new();
        for (name, schema) in &input.table_name_schema_mapping {
            let existed = dest.schemas.contains_key(name);
            dest.schemas.insert(name.clone(), schema.clone());
            dest.tables.entry(name.clone()).or_default();
            table_exists_mapping.insert(name.clone(), existed);
        }
        Ok(SetupNormalizedTableOutput {
            table_exists_mapping,
        })
    }

    async fn start_flow(
        &self,
        ctx: &ActivityContext,
        input: &StartFlowInput,
    ) -> anyhow::Result<SyncResponse> {
        ctx.record_heartbeat("pulling records");
        let batch = self.cdc_batches.lock().unwrap().pop_front();
        let mut dest = self.dest.lock().unwrap();
        // schema mapping travels with the step input, exactly what the
        // destination would be initialized with
        for (name, schema) in &input.flow_connection_configs.table_name_schema_mapping {
            dest.schemas.insert(name.clone(), schema.clone());
        }
        Ok(match batch {
            Some((records, deltas)) => {
                let mut res = dest.sync_records(&records);
                res.table_schema_deltas = deltas;
                res
            }
            None => SyncResponse::default(),
        })
    }

    async fn start_normalize(
        &self,
        _ctx: &ActivityContext,
        input: &StartNormalizeInput,
    ) -> anyhow::Result<NormalizeResponse> {
        Ok(self
            .dest
            .lock()
            .unwrap()
            .normalize_records(input.flow_connection_configs.soft_delete))
    }

    async fn replay_table_schema_deltas(
        &self,
        input: &ReplayTableSchemaDeltaInput,
    ) -> anyhow::Result<()> {
        let mut dest = self.dest.lock().unwrap();
        for delta in &input.table_schema_deltas {
            if let Some(schema) = dest.schemas.get_mut(&delta.dst_table_name) {
                for added in &delta.added_columns {
                    if schema.column_kind(&added.column_name).is_none() {
                        schema.columns.push(pt::ColumnDescriptor {
                            name: added.column_name.clone(),
                            kind: added.column_kind.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_wal_heartbeat(&self, _source: &Peer) -> anyhow::Result<()> {
        self.wal_heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_flow(&self, req: &ShutdownRequest) -> anyhow::Result<()> {
        // only job-derived objects are dropped; adopted ones stay
        if let Some(created) = self.created_slot.lock().unwrap().as_ref() {
            self.dropped_objects
                .lock()
                .unwrap()
                .push(format!("slot:{}", created));
        }
        self.dropped_objects
            .lock()
            .unwrap()
            .push(format!("raw:{}", req.flow_job_name));
        self.dest.lock().unwrap().sync_flow_cleanup();
        Ok(())
    }

    async fn generate_run_uuid(&self) -> anyhow::Result<String> {
        Ok(format!(
            "run-{}",
            self.run_counter.fetch_add(1, Ordering::SeqCst)
        ))
    }

    async fn setup_qrep_metadata_tables(&self, _config: &QRepConfig) -> anyhow::Result<()> {
        self.dest.lock().unwrap().metadata_tables_created = true;
        Ok(())
    }

    async fn get_qrep_partitions(
        &self,
        _ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>> {
        Ok(self.qrep_source.lock().unwrap().get_partitions(
            config.num_rows_per_partition,
            last,
            run_uuid,
        ))
    }

    async fn replicate_qrep_partitions(
        &self,
        _ctx: &ActivityContext,
        config: &QRepConfig,
        batch: &QRepPartitionBatch,
        _run_uuid: &str,
    ) -> anyhow::Result<()> {
        for partition in &batch.partitions {
            let rows = {
                let source = self.qrep_source.lock().unwrap();
                source.rows_in_range(&partition.range)
            };
            let mut dest = self.dest.lock().unwrap();
            if dest.synced_partitions.contains(&partition.partition_id) {
                continue;
            }
            dest.qrep_tables
                .entry(config.destination_table_identifier.clone())
                .or_default()
                .extend(rows.into_iter().map(|id| QRecord::new(vec![Value::BigInt(id)])));
            dest.synced_partitions.insert(partition.partition_id.clone());
        }
        Ok(())
    }

    async fn consolidate_qrep_partitions(
        &self,
        _ctx: &ActivityContext,
        _config: &QRepConfig,
        _run_uuid: &str,
    ) -> anyhow::Result<()> {
        self.dest.lock().unwrap().consolidated = true;
        Ok(())
    }

    async fn cleanup_qrep_flow(&self, _config: &QRepConfig) -> anyhow::Result<()> {
        self.dest.lock().unwrap().qrep_cleaned_up = true;
        Ok(())
    }

    async fn qrep_wait_until_new_rows(
        &self,
        ctx: &ActivityContext,
        _config: &QRepConfig,
        _last: Option<&QRepPartition>,
    ) -> anyhow::Result<()> {
        ctx.record_heartbeat("waiting for rows");
        ctx.cancellation_token().cancelled().await;
        Ok(())
    }
}
