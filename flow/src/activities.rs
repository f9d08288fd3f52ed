//! Activity implementations: every side-effecting step of the CDC and
//! QRep pipelines. Activities are invoked through the runtime in
//! `orchestrator`, which owns retries and heartbeat supervision.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use catalog::{CatalogMirrorMonitor, CdcBatchInfo};
use chrono::Utc;
use connectors::{
    get_cdc_normalize_connector, get_cdc_pull_connector, get_cdc_sync_connector,
    get_qrep_consolidate_connector, get_qrep_pull_connector, get_qrep_sync_connector,
};
use metrics::counter;
use model::{
    qrecord_stream, NormalizeRecordsRequest, NormalizeResponse, PullRecordsRequest, SyncRecordsRequest,
    SyncResponse, FETCH_AND_CHANNEL_SIZE,
};
use pt::{
    CreateRawTableInput, CreateRawTableOutput, EnsurePullabilityInput, EnsurePullabilityOutput,
    GetTableSchemaInput, LastSyncState, Peer, QRepConfig, QRepPartition, QRepPartitionBatch,
    ReplayTableSchemaDeltaInput, SetupNormalizedTableInput, SetupNormalizedTableOutput,
    SetupReplicationInput, SetupReplicationOutput, ShutdownRequest, StartFlowInput,
    StartNormalizeInput, TableSchema,
};
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::{heartbeat_routine, ActivityContext};

pub struct CheckConnectionResult {
    pub needs_setup_metadata_tables: bool,
}

/// The activity interface workflows are written against. The worker
/// registers `FlowableActivity`; tests drive the same choreography with
/// in-memory connectors.
#[async_trait::async_trait]
pub trait FlowActivities: Send + Sync {
    async fn check_connection(&self, peer: &Peer) -> anyhow::Result<CheckConnectionResult>;

    async fn setup_metadata_tables(&self, peer: &Peer) -> anyhow::Result<()>;

    async fn get_last_synced_id(
        &self,
        peer: &Peer,
        flow_job_name: &str,
    ) -> anyhow::Result<Option<LastSyncState>>;

    async fn ensure_pullability(
        &self,
        input: &EnsurePullabilityInput,
    ) -> anyhow::Result<EnsurePullabilityOutput>;

    async fn get_table_schema(
        &self,
        input: &GetTableSchemaInput,
    ) -> anyhow::Result<HashMap<String, TableSchema>>;

    async fn setup_replication(
        &self,
        input: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput>;

    async fn create_raw_table(
        &self,
        input: &CreateRawTableInput,
    ) -> anyhow::Result<CreateRawTableOutput>;

    async fn create_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput>;

    async fn start_flow(
        &self,
        ctx: &ActivityContext,
        input: &StartFlowInput,
    ) -> anyhow::Result<SyncResponse>;

    async fn start_normalize(
        &self,
        ctx: &ActivityContext,
        input: &StartNormalizeInput,
    ) -> anyhow::Result<NormalizeResponse>;

    async fn replay_table_schema_deltas(
        &self,
        input: &ReplayTableSchemaDeltaInput,
    ) -> anyhow::Result<()>;

    async fn send_wal_heartbeat(&self, source: &Peer) -> anyhow::Result<()>;

    async fn drop_flow(&self, req: &ShutdownRequest) -> anyhow::Result<()>;

    async fn generate_run_uuid(&self) -> anyhow::Result<String>;

    async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> anyhow::Result<()>;

    async fn get_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>>;

    async fn replicate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        batch: &QRepPartitionBatch,
        run_uuid: &str,
    ) -> anyhow::Result<()>;

    async fn consolidate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        run_uuid: &str,
    ) -> anyhow::Result<()>;

    async fn cleanup_qrep_flow(&self, config: &QRepConfig) -> anyhow::Result<()>;

    async fn qrep_wait_until_new_rows(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> anyhow::Result<()>;
}

/// The activity set a worker registers. Holds only the monitoring sink;
/// connectors are constructed per call, as every activity invocation may
/// land on a different worker.
#[derive(Clone)]
pub struct FlowableActivity {
    monitor: CatalogMirrorMonitor,
}

impl FlowableActivity {
    pub fn new(monitor: CatalogMirrorMonitor) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &CatalogMirrorMonitor {
        &self.monitor
    }

    pub async fn check_connection(&self, peer: &Peer) -> anyhow::Result<CheckConnectionResult> {
        let dst = get_cdc_sync_connector(peer).await?;
        Ok(CheckConnectionResult {
            needs_setup_metadata_tables: dst.needs_setup_metadata_tables().await,
        })
    }

    pub async fn setup_metadata_tables(&self, peer: &Peer) -> anyhow::Result<()> {
        let dst = get_cdc_sync_connector(peer).await?;
        dst.setup_metadata_tables()
            .await
            .context("failed to setup metadata tables")
    }

    pub async fn get_last_synced_id(
        &self,
        peer: &Peer,
        flow_job_name: &str,
    ) -> anyhow::Result<Option<LastSyncState>> {
        let dst = get_cdc_sync_connector(peer).await?;
        dst.get_last_offset(flow_job_name).await
    }

    pub async fn ensure_pullability(
        &self,
        input: &EnsurePullabilityInput,
    ) -> anyhow::Result<EnsurePullabilityOutput> {
        let src = get_cdc_pull_connector(&input.peer).await?;
        let table_identifier_mapping = src
            .ensure_pullability(&input.source_table_identifiers)
            .await
            .context("failed to ensure pullability")?;
        Ok(EnsurePullabilityOutput {
            table_identifier_mapping,
        })
    }

    pub async fn get_table_schema(
        &self,
        input: &GetTableSchemaInput,
    ) -> anyhow::Result<HashMap<String, TableSchema>> {
        let src = get_cdc_pull_connector(&input.peer).await?;
        src.get_table_schema(&input.table_identifiers).await
    }

    pub async fn setup_replication(
        &self,
        input: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput> {
        let src = get_cdc_pull_connector(&input.peer).await?;
        src.setup_replication(input).await
    }

    pub async fn create_raw_table(
        &self,
        input: &CreateRawTableInput,
    ) -> anyhow::Result<CreateRawTableOutput> {
        let dst = get_cdc_sync_connector(&input.peer).await?;
        let table_identifier = dst.create_raw_table(&input.flow_job_name).await?;
        self.monitor.initialize_cdc_flow(&input.flow_job_name).await?;
        Ok(CreateRawTableOutput { table_identifier })
    }

    pub async fn create_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput> {
        let dst = get_cdc_sync_connector(&input.peer).await?;
        dst.setup_normalized_tables(input).await
    }

    /// One pull→sync round: stream a batch out of the source and land it
    /// in the destination raw table.
    pub async fn start_flow(
        &self,
        ctx: &ActivityContext,
        input: &StartFlowInput,
    ) -> anyhow::Result<SyncResponse> {
        ctx.record_heartbeat("starting flow");
        let configs = &input.flow_connection_configs;

        let src = get_cdc_pull_connector(&configs.source).await?;
        let mut dst = get_cdc_sync_connector(&configs.destination).await?;

        info!(flow = %configs.flow_job_name, "initializing table schema");
        dst.initialize_table_schema(configs.table_name_schema_mapping.clone())?;
        ctx.record_heartbeat("initialized table schema");

        let pull_start = Utc::now();
        let pull_result = src
            .pull_records(
                PullRecordsRequest {
                    flow_job_name: configs.flow_job_name.clone(),
                    last_sync_state: input.last_sync_state,
                    max_batch_size: input.sync_flow_options.batch_size,
                    idle_timeout: Duration::from_secs(10),
                    src_table_id_name_mapping: configs.src_table_id_name_mapping.clone(),
                    table_name_mapping: configs.table_name_mapping(),
                    table_name_schema_mapping: configs.table_name_schema_mapping.clone(),
                    override_publication_name: configs.publication_name.clone(),
                    override_replication_slot_name: configs.replication_slot_name.clone(),
                    relation_message_mapping: input.relation_message_mapping.clone(),
                },
                ctx.cancellation_token(),
            )
            .await
            .context("failed to pull records")?;

        let record_batch = pull_result.record_batch;
        let num_records = record_batch.len();
        ctx.record_heartbeat(&format!("pulled {} records", num_records));
        counter!("peerdb_flow_records_pulled_total", "flow" => configs.flow_job_name.clone())
            .increment(num_records as u64);

        if num_records == 0 {
            info!(flow = %configs.flow_job_name, "no records to push");
            return Ok(SyncResponse {
                table_schema_deltas: record_batch.schema_deltas,
                relation_message_mapping: pull_result.relation_message_mapping,
                ..Default::default()
            });
        }

        if self.monitor.is_active() {
            let sync_batch_id = dst.get_last_sync_batch_id(&configs.flow_job_name).await?;
            self.monitor
                .add_cdc_batch_for_flow(
                    &configs.flow_job_name,
                    CdcBatchInfo {
                        batch_id: sync_batch_id + 1,
                        rows_in_batch: num_records as i64,
                        batch_start_lsn: record_batch.first_checkpoint,
                        batch_end_lsn: record_batch.last_checkpoint,
                        start_time: pull_start,
                    },
                )
                .await?;
        }

        let _heartbeats = heartbeat_routine(ctx, Duration::from_secs(10), {
            let job = configs.flow_job_name.clone();
            move || format!("pushing records for job - {}", job)
        });

        let schema_deltas = record_batch.schema_deltas.clone();
        let last_checkpoint = record_batch.last_checkpoint;
        let mut res = dst
            .sync_records(SyncRecordsRequest {
                flow_job_name: configs.flow_job_name.clone(),
                records: record_batch,
                sync_mode: configs.cdc_sync_mode,
                staging_path: configs.cdc_staging_path.clone(),
            })
            .await
            .context("failed to push records")?;

        self.monitor
            .update_latest_lsn_at_target(&configs.flow_job_name, last_checkpoint)
            .await?;
        if !res.table_name_rows_mapping.is_empty() {
            self.monitor
                .add_cdc_batch_tables_for_flow(
                    &configs.flow_job_name,
                    res.current_sync_batch_id,
                    &res.table_name_rows_mapping,
                )
                .await?;
        }

        res.table_schema_deltas = schema_deltas;
        res.relation_message_mapping = pull_result.relation_message_mapping;
        ctx.record_heartbeat(&format!("pushed {} records", num_records));
        counter!("peerdb_flow_records_synced_total", "flow" => configs.flow_job_name.clone())
            .increment(res.num_records_synced);
        info!(
            flow = %configs.flow_job_name,
            "pushed {} records, batch id {}",
            res.num_records_synced, res.current_sync_batch_id
        );
        Ok(res)
    }

    /// Merge landed batches into the normalized tables. Destinations
    /// without a normalize capability finish the batch bookkeeping only.
    pub async fn start_normalize(
        &self,
        ctx: &ActivityContext,
        input: &StartNormalizeInput,
    ) -> anyhow::Result<NormalizeResponse> {
        let configs = &input.flow_connection_configs;
        let mut dst = match get_cdc_normalize_connector(&configs.destination).await {
            Err(err) if err.is_unsupported() => {
                let sync = get_cdc_sync_connector(&configs.destination).await?;
                let last_sync_batch_id = sync.get_last_sync_batch_id(&configs.flow_job_name).await?;
                self.monitor
                    .update_end_time_for_cdc_batch(&configs.flow_job_name, last_sync_batch_id)
                    .await?;
                return Ok(NormalizeResponse {
                    done: true,
                    start_batch_id: 0,
                    end_batch_id: last_sync_batch_id,
                });
            }
            other => other?,
        };

        let _heartbeats = heartbeat_routine(ctx, Duration::from_secs(120), {
            let job = configs.flow_job_name.clone();
            move || format!("normalizing records for job - {}", job)
        });

        dst.initialize_table_schema(configs.table_name_schema_mapping.clone())?;
        let res = dst
            .normalize_records(&NormalizeRecordsRequest {
                flow_job_name: configs.flow_job_name.clone(),
                soft_delete: configs.soft_delete,
            })
            .await
            .context("failed to normalize records")?;

        if res.done {
            self.monitor
                .update_end_time_for_cdc_batch(&configs.flow_job_name, res.end_batch_id)
                .await?;
        }
        info!(
            flow = %configs.flow_job_name,
            "normalized records from batch {} to batch {}",
            res.start_batch_id, res.end_batch_id
        );
        Ok(res)
    }

    pub async fn replay_table_schema_deltas(
        &self,
        input: &ReplayTableSchemaDeltaInput,
    ) -> anyhow::Result<()> {
        let configs = &input.flow_connection_configs;
        let dst = match get_cdc_normalize_connector(&configs.destination).await {
            Err(err) if err.is_unsupported() => return Ok(()),
            other => other?,
        };
        dst.replay_table_schema_deltas(&configs.flow_job_name, &input.table_schema_deltas)
            .await
    }

    pub async fn send_wal_heartbeat(&self, source: &Peer) -> anyhow::Result<()> {
        let src = get_cdc_pull_connector(source).await?;
        src.send_wal_heartbeat()
            .await
            .context("failed to send WAL heartbeat")
    }

    pub async fn drop_flow(&self, req: &ShutdownRequest) -> anyhow::Result<()> {
        let src = get_cdc_pull_connector(&req.source_peer).await?;
        let dst = get_cdc_sync_connector(&req.destination_peer).await?;
        src.pull_flow_cleanup(&req.flow_job_name)
            .await
            .context("failed to cleanup source")?;
        dst.sync_flow_cleanup(&req.flow_job_name)
            .await
            .context("failed to cleanup destination")?;
        Ok(())
    }

    /// Run ids come from an activity so workflow code itself stays
    /// deterministic.
    pub async fn generate_run_uuid(&self) -> anyhow::Result<String> {
        Ok(Uuid::new_v4().to_string())
    }

    pub async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> anyhow::Result<()> {
        let dst = get_qrep_sync_connector(&config.destination_peer).await?;
        dst.setup_qrep_metadata_tables(config).await
    }

    pub async fn get_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>> {
        let src = get_qrep_pull_connector(&config.source_peer).await?;
        let _heartbeats = heartbeat_routine(ctx, Duration::from_secs(120), {
            let job = config.flow_job_name.clone();
            move || format!("getting partitions for job - {}", job)
        });
        let partitions = src
            .get_qrep_partitions(config, last, run_uuid)
            .await
            .context("failed to get partitions from source")?;
        if !partitions.is_empty() {
            self.monitor
                .initialize_qrep_run(config, run_uuid, &partitions)
                .await?;
        }
        Ok(partitions)
    }

    pub async fn replicate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        batch: &QRepPartitionBatch,
        run_uuid: &str,
    ) -> anyhow::Result<()> {
        self.monitor.update_start_time_for_qrep_run(run_uuid).await?;
        let total = batch.partitions.len();
        info!(
            flow = %config.flow_job_name,
            "replicating batch {} with {} partition(s)",
            batch.batch_id, total
        );
        for (idx, partition) in batch.partitions.iter().enumerate() {
            self.replicate_qrep_partition(ctx, config, idx + 1, total, partition, run_uuid)
                .await?;
        }
        Ok(())
    }

    async fn replicate_qrep_partition(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        idx: usize,
        total: usize,
        partition: &QRepPartition,
        run_uuid: &str,
    ) -> anyhow::Result<()> {
        let dst = get_qrep_sync_connector(&config.destination_peer).await?;
        if dst
            .is_qrep_partition_synced(&config.flow_job_name, &partition.partition_id)
            .await?
        {
            info!(
                "partition {} already synced, skipping",
                partition.partition_id
            );
            return Ok(());
        }
        self.monitor
            .update_start_time_for_partition(run_uuid, partition)
            .await?;

        let src = get_qrep_pull_connector(&config.source_peer).await?;
        let (sender, receiver) = qrecord_stream(FETCH_AND_CHANNEL_SIZE);

        let pull_handle = {
            let config = config.clone();
            let partition = partition.clone();
            let monitor = self.monitor.clone();
            let run_uuid = run_uuid.to_owned();
            tokio::spawn(async move {
                let rows = src.pull_qrep_records(&config, &partition, sender).await?;
                monitor
                    .update_pull_end_time_and_rows_for_partition(&run_uuid, &partition, rows as i64)
                    .await?;
                Ok::<u64, anyhow::Error>(rows)
            })
        };

        let _heartbeats = heartbeat_routine(ctx, Duration::from_secs(120), {
            let partition_id = partition.partition_id.clone();
            move || format!("syncing partition - {}: {} of {} total", partition_id, idx, total)
        });

        let rows_synced = dst
            .sync_qrep_records(config, partition, receiver)
            .await
            .context("failed to sync records")?;

        if rows_synced == 0 {
            info!(
                "no records to push for partition {}",
                partition.partition_id
            );
            pull_handle.abort();
        } else {
            pull_handle
                .await
                .context("pull task panicked")?
                .context("failed to pull records")?;
            counter!("peerdb_flow_qrep_rows_synced_total", "flow" => config.flow_job_name.clone())
                .increment(rows_synced);
        }

        self.monitor
            .update_end_time_for_partition(run_uuid, partition)
            .await?;
        Ok(())
    }

    pub async fn consolidate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        run_uuid: &str,
    ) -> anyhow::Result<()> {
        let dst = match get_qrep_consolidate_connector(&config.destination_peer).await {
            Err(err) if err.is_unsupported() => {
                return self.monitor.update_end_time_for_qrep_run(run_uuid).await;
            }
            other => other?,
        };
        let _heartbeats = heartbeat_routine(ctx, Duration::from_secs(120), {
            let job = config.flow_job_name.clone();
            move || format!("consolidating partitions for job - {}", job)
        });
        dst.consolidate_qrep_partitions(config).await?;
        self.monitor.update_end_time_for_qrep_run(run_uuid).await
    }

    pub async fn cleanup_qrep_flow(&self, config: &QRepConfig) -> anyhow::Result<()> {
        match get_qrep_consolidate_connector(&config.destination_peer).await {
            Err(err) if err.is_unsupported() => Ok(()),
            Err(err) => Err(err.into()),
            Ok(dst) => dst.cleanup_qrep_flow(&config.flow_job_name).await,
        }
    }

    /// Poll the source until rows past the last partition appear.
    pub async fn qrep_wait_until_new_rows(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> anyhow::Result<()> {
        let wait = if config.wait_between_batches_seconds > 0 {
            Duration::from_secs(config.wait_between_batches_seconds as u64)
        } else {
            Duration::from_secs(5)
        };
        let src = get_qrep_pull_connector(&config.source_peer).await?;
        let mut attempt = 1;
        loop {
            ctx.record_heartbeat(&format!("no new rows yet, attempt #{}", attempt));
            tokio::select! {
                _ = ctx.cancellation_token().cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
            if src
                .check_for_updated_max_value(config, last)
                .await
                .context("failed to check for new rows")?
            {
                return Ok(());
            }
            attempt += 1;
        }
    }
}

#[async_trait::async_trait]
impl FlowActivities for FlowableActivity {
    async fn check_connection(&self, peer: &Peer) -> anyhow::Result<CheckConnectionResult> {
        FlowableActivity::check_connection(self, peer).await
    }

    async fn setup_metadata_tables(&self, peer: &Peer) -> anyhow::Result<()> {
        FlowableActivity::setup_metadata_tables(self, peer).await
    }

    async fn get_last_synced_id(
        &self,
        peer: &Peer,
        flow_job_name: &str,
    ) -> anyhow::Result<Option<LastSyncState>> {
        FlowableActivity::get_last_synced_id(self, peer, flow_job_name).await
    }

    async fn ensure_pullability(
        &self,
        input: &EnsurePullabilityInput,
    ) -> anyhow::Result<EnsurePullabilityOutput> {
        FlowableActivity::ensure_pullability(self, input).await
    }

    async fn get_table_schema(
        &self,
        input: &GetTableSchemaInput,
    ) -> anyhow::Result<HashMap<String, TableSchema>> {
        FlowableActivity::get_table_schema(self, input).await
    }

    async fn setup_replication(
        &self,
        input: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput> {
        FlowableActivity::setup_replication(self, input).await
    }

    async fn create_raw_table(
        &self,
        input: &CreateRawTableInput,
    ) -> anyhow::Result<CreateRawTableOutput> {
        FlowableActivity::create_raw_table(self, input).await
    }

    async fn create_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput> {
        FlowableActivity::create_normalized_tables(self, input).await
    }

    async fn start_flow(
        &self,
        ctx: &ActivityContext,
        input: &StartFlowInput,
    ) -> anyhow::Result<SyncResponse> {
        FlowableActivity::start_flow(self, ctx, input).await
    }

    async fn start_normalize(
        &self,
        ctx: &ActivityContext,
        input: &StartNormalizeInput,
    ) -> anyhow::Result<NormalizeResponse> {
        FlowableActivity::start_normalize(self, ctx, input).await
    }

    async fn replay_table_schema_deltas(
        &self,
        input: &ReplayTableSchemaDeltaInput,
    ) -> anyhow::Result<()> {
        FlowableActivity::replay_table_schema_deltas(self, input).await
    }

    async fn send_wal_heartbeat(&self, source: &Peer) -> anyhow::Result<()> {
        FlowableActivity::send_wal_heartbeat(self, source).await
    }

    async fn drop_flow(&self, req: &ShutdownRequest) -> anyhow::Result<()> {
        FlowableActivity::drop_flow(self, req).await
    }

    async fn generate_run_uuid(&self) -> anyhow::Result<String> {
        FlowableActivity::generate_run_uuid(self).await
    }

    async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> anyhow::Result<()> {
        FlowableActivity::setup_qrep_metadata_tables(self, config).await
    }

    async fn get_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>> {
        FlowableActivity::get_qrep_partitions(self, ctx, config, last, run_uuid).await
    }

    async fn replicate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        batch: &QRepPartitionBatch,
        run_uuid: &str,
    ) -> anyhow::Result<()> {
        FlowableActivity::replicate_qrep_partitions(self, ctx, config, batch, run_uuid).await
    }

    async fn consolidate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        run_uuid: &str,
    ) -> anyhow::Result<()> {
        FlowableActivity::consolidate_qrep_partitions(self, ctx, config, run_uuid).await
    }

    async fn cleanup_qrep_flow(&self, config: &QRepConfig) -> anyhow::Result<()> {
        FlowableActivity::cleanup_qrep_flow(self, config).await
    }

    async fn qrep_wait_until_new_rows(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> anyhow::Result<()> {
        FlowableActivity::qrep_wait_until_new_rows(self, ctx, config, last).await
    }
}
