//! The long-running CDC workflow: SETUP, the pull/sync/normalize loop
//! with continue-as-new, and SHUTDOWN cleanup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use pt::{
    CdcFlowStatus, ColumnDescriptor, CreateRawTableInput, EnsurePullabilityInput,
    FlowConnectionConfigs, GetTableSchemaInput, LastSyncState, NormalizeFlowStatus,
    RelationMessageMapping, ReplayTableSchemaDeltaInput, SetupNormalizedTableInput,
    SetupReplicationInput, ShutdownRequest, StartFlowInput, StartNormalizeInput, SyncFlowOptions,
    TableSchemaDelta,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activities::FlowActivities;
use crate::orchestrator::{execute_activity, ActivityOptions};
use crate::workflows::{ended_by_shutdown, snapshot_flow};

/// Iterations before the workflow truncates its history via
/// continue-as-new.
const SYNC_FLOWS_PER_RUN: u32 = 32;
/// Consecutive empty pulls before the slot is kept alive with a WAL
/// heartbeat.
const EMPTY_PULLS_PER_WAL_HEARTBEAT: u32 = 3;
const DEFAULT_MAX_BATCH_SIZE: u32 = 8192;
/// Upper bound on one pull/sync round; the pull idles out long before
/// this.
const START_FLOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// State carried across continue-as-new boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdcFlowState {
    pub offset: Option<i64>,
    pub sync_batch_id: i64,
    pub normalize_batch_id: i64,
    pub relation_message_mapping: RelationMessageMapping,
    pub setup_complete: bool,
}

pub enum CdcFlowOutcome {
    ContinueAsNew(Box<CdcFlowState>),
    Finished,
}

pub struct CdcFlowWorkflow {
    activities: Arc<dyn FlowActivities>,
    shutdown: CancellationToken,
    status: Arc<RwLock<CdcFlowStatus>>,
}

impl CdcFlowWorkflow {
    pub fn new(
        activities: Arc<dyn FlowActivities>,
        shutdown: CancellationToken,
        status: Arc<RwLock<CdcFlowStatus>>,
    ) -> Self {
        Self {
            activities,
            shutdown,
            status,
        }
    }

    /// Drive the flow to completion, continuing-as-new between runs.
    pub async fn run(&self, configs: &FlowConnectionConfigs) -> anyhow::Result<()> {
        let mut configs = configs.clone();
        let mut state = CdcFlowState::default();
        loop {
            match self.run_once(&mut configs, state).await {
                Ok(CdcFlowOutcome::ContinueAsNew(next)) => state = *next,
                Ok(CdcFlowOutcome::Finished) => return Ok(()),
                Err(err) => {
                    self.status.write().await.error_message = Some(format!("{:#}", err));
                    return Err(err);
                }
            }
        }
    }

    async fn run_once(
        &self,
        configs: &mut FlowConnectionConfigs,
        mut state: CdcFlowState,
    ) -> anyhow::Result<CdcFlowOutcome> {
        if !state.setup_complete {
            self.setup(configs).await?;
            state.setup_complete = true;
            self.status.write().await.setup_complete = true;
        }

        let mut empty_pulls: u32 = 0;
        for _ in 0..SYNC_FLOWS_PER_RUN {
            if self.shutdown.is_cancelled() {
                return self.shutdown_flow(configs).await;
            }

            if state.offset.is_none() {
                state.offset = self
                    .activity(ActivityOptions::default(), |ctx| {
                        let activities = self.activities.clone();
                        let destination = configs.destination.clone();
                        let job = configs.flow_job_name.clone();
                        async move {
                            let _ = ctx;
                            activities.get_last_synced_id(&destination, &job).await
                        }
                    })
                    .await
                    .context("failed to read last synced offset")?
                    .map(|s| s.checkpoint);
            }

            let start_flow_input = StartFlowInput {
                flow_connection_configs: configs.clone(),
                last_sync_state: state.offset.map(|checkpoint| LastSyncState { checkpoint }),
                sync_flow_options: SyncFlowOptions {
                    batch_size: if configs.max_batch_size > 0 {
                        configs.max_batch_size
                    } else {
                        DEFAULT_MAX_BATCH_SIZE
                    },
                },
                relation_message_mapping: state.relation_message_mapping.clone(),
            };
            let res = match execute_activity(
                ActivityOptions::with_heartbeat(START_FLOW_TIMEOUT, Duration::from_secs(10)),
                &self.shutdown,
                |ctx| {
                    let activities = self.activities.clone();
                    let input = start_flow_input.clone();
                    async move { activities.start_flow(&ctx, &input).await }
                },
            )
            .await
            {
                Ok(res) => res,
                Err(err) if ended_by_shutdown(&err) => {
                    return self.shutdown_flow(configs).await;
                }
                Err(err) => return Err(err).context("sync flow failed"),
            };

            state.relation_message_mapping = res.relation_message_mapping.clone();

            if !res.table_schema_deltas.is_empty() {
                apply_schema_deltas(configs, &res.table_schema_deltas);
                let replay_input = ReplayTableSchemaDeltaInput {
                    flow_connection_configs: configs.clone(),
                    table_schema_deltas: res.table_schema_deltas.clone(),
                };
                self.activity(ActivityOptions::default(), |_ctx| {
                    let activities = self.activities.clone();
                    let input = replay_input.clone();
                    async move { activities.replay_table_schema_deltas(&input).await }
                })
                .await
                .context("failed to replay schema deltas")?;
            }

            if res.num_records_synced > 0 {
                state.offset = Some(res.last_synced_checkpoint);
                state.sync_batch_id = res.current_sync_batch_id;
                empty_pulls = 0;

                let normalize_input = StartNormalizeInput {
                    flow_connection_configs: configs.clone(),
                };
                let norm = self
                    .activity(
                        ActivityOptions::with_heartbeat(
                            Duration::from_secs(15 * 60),
                            Duration::from_secs(120),
                        ),
                        |ctx| {
                            let activities = self.activities.clone();
                            let input = normalize_input.clone();
                            async move { activities.start_normalize(&ctx, &input).await }
                        },
                    )
                    .await
                    .context("normalize flow failed")?;
                state.normalize_batch_id = norm.end_batch_id;
                self.status
                    .write()
                    .await
                    .normalize_flow_statuses
                    .push(NormalizeFlowStatus {
                        start_batch_id: norm.start_batch_id,
                        end_batch_id: norm.end_batch_id,
                        finished_at: Utc::now(),
                    });
            } else {
                empty_pulls += 1;
                if empty_pulls >= EMPTY_PULLS_PER_WAL_HEARTBEAT {
                    empty_pulls = 0;
                    self.activity(ActivityOptions::default(), |_ctx| {
                        let activities = self.activities.clone();
                        let source = configs.source.clone();
                        async move { activities.send_wal_heartbeat(&source).await }
                    })
                    .await
                    .context("failed to send WAL heartbeat")?;
                }
            }
        }

        info!(
            flow = %configs.flow_job_name,
            "continuing as new after {} sync flows", SYNC_FLOWS_PER_RUN
        );
        Ok(CdcFlowOutcome::ContinueAsNew(Box::new(state)))
    }

    async fn setup(&self, configs: &mut FlowConnectionConfigs) -> anyhow::Result<()> {
        info!(flow = %configs.flow_job_name, "setting up cdc flow");

        let check = self
            .activity(ActivityOptions::default(), |_ctx| {
                let activities = self.activities.clone();
                let destination = configs.destination.clone();
                async move { activities.check_connection(&destination).await }
            })
            .await
            .context("destination connection check failed")?;
        if check.needs_setup_metadata_tables {
            self.activity(ActivityOptions::default(), |_ctx| {
                let activities = self.activities.clone();
                let destination = configs.destination.clone();
                async move { activities.setup_metadata_tables(&destination).await }
            })
            .await
            .context("failed to setup metadata tables")?;
        }

        let source_tables: Vec<String> = configs
            .table_mappings
            .iter()
            .map(|m| m.source_table_identifier.clone())
            .collect();

        let pullability_input = EnsurePullabilityInput {
            peer: configs.source.clone(),
            flow_job_name: configs.flow_job_name.clone(),
            source_table_identifiers: source_tables.clone(),
        };
        let pullability = self
            .activity(ActivityOptions::default(), |_ctx| {
                let activities = self.activities.clone();
                let input = pullability_input.clone();
                async move { activities.ensure_pullability(&input).await }
            })
            .await
            .context("failed to ensure pullability")?;
        configs.src_table_id_name_mapping = pullability
            .table_identifier_mapping
            .into_iter()
            .map(|(name, rel_id)| (rel_id, name))
            .collect();

        let schema_input = GetTableSchemaInput {
            peer: configs.source.clone(),
            table_identifiers: source_tables,
        };
        let source_schemas = self
            .activity(ActivityOptions::default(), |_ctx| {
                let activities = self.activities.clone();
                let input = schema_input.clone();
                async move { activities.get_table_schema(&input).await }
            })
            .await
            .context("failed to fetch table schemas")?;
        let table_name_mapping = configs.table_name_mapping();
        configs.table_name_schema_mapping = source_schemas
            .into_iter()
            .filter_map(|(src, schema)| {
                table_name_mapping.get(&src).map(|dst| (dst.clone(), schema))
            })
            .collect();

        let replication_input = SetupReplicationInput {
            peer: configs.source.clone(),
            flow_job_name: configs.flow_job_name.clone(),
            table_name_mapping: configs.table_name_mapping(),
            existing_publication_name: configs.publication_name.clone(),
            existing_replication_slot_name: configs.replication_slot_name.clone(),
            do_initial_copy: configs.do_initial_copy,
        };
        let replication = self
            .activity(ActivityOptions::default(), |_ctx| {
                let activities = self.activities.clone();
                let input = replication_input.clone();
                async move { activities.setup_replication(&input).await }
            })
            .await
            .context("failed to setup replication")?;

        let raw_table_input = CreateRawTableInput {
            peer: configs.destination.clone(),
            flow_job_name: configs.flow_job_name.clone(),
        };
        self.activity(ActivityOptions::default(), |_ctx| {
            let activities = self.activities.clone();
            let input = raw_table_input.clone();
            async move { activities.create_raw_table(&input).await }
        })
        .await
        .context("failed to create raw table")?;

        let normalized_input = SetupNormalizedTableInput {
            peer: configs.destination.clone(),
            table_name_schema_mapping: configs.table_name_schema_mapping.clone(),
            soft_delete: configs.soft_delete,
        };
        self.activity(ActivityOptions::default(), |_ctx| {
            let activities = self.activities.clone();
            let input = normalized_input.clone();
            async move { activities.create_normalized_tables(&input).await }
        })
        .await
        .context("failed to create normalized tables")?;

        if configs.do_initial_copy {
            // the slot is not consumed until the snapshot finishes; CDC
            // then starts from the consistent point
            snapshot_flow::run(
                &self.activities,
                configs,
                &replication.snapshot_name,
                replication.consistent_point,
                &self.shutdown,
            )
            .await
            .context("snapshot flow failed")?;
        }

        Ok(())
    }

    async fn shutdown_flow(
        &self,
        configs: &FlowConnectionConfigs,
    ) -> anyhow::Result<CdcFlowOutcome> {
        info!(flow = %configs.flow_job_name, "shutdown signalled, dropping flow");
        // the shutdown token is already cancelled; cleanup runs under its
        // own token
        let cleanup_token = CancellationToken::new();
        let req = ShutdownRequest {
            flow_job_name: configs.flow_job_name.clone(),
            workflow_id: String::new(),
            source_peer: configs.source.clone(),
            destination_peer: configs.destination.clone(),
        };
        let result = execute_activity(ActivityOptions::default(), &cleanup_token, |_ctx| {
            let activities = self.activities.clone();
            let req = req.clone();
            async move { activities.drop_flow(&req).await }
        })
        .await;
        if let Err(err) = result {
            warn!(flow = %configs.flow_job_name, "drop flow failed: {:#}", err);
            self.status.write().await.error_message = Some(format!("{:#}", err));
        }
        Ok(CdcFlowOutcome::Finished)
    }

    async fn activity<T, F, Fut>(&self, options: ActivityOptions, body: F) -> anyhow::Result<T>
    where
        F: Fn(crate::orchestrator::ActivityContext) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        execute_activity(options, &self.shutdown, body)
            .await
            .map_err(anyhow::Error::from)
    }
}

/// Fold schema deltas into the in-memory schema mapping so the next
/// normalize merges the new columns.
fn apply_schema_deltas(configs: &mut FlowConnectionConfigs, deltas: &[TableSchemaDelta]) {
    for delta in deltas {
        let Some(schema) = configs
            .table_name_schema_mapping
            .get_mut(&delta.dst_table_name)
        else {
            continue;
        };
        for added in &delta.added_columns {
            match schema
                .columns
                .iter_mut()
                .find(|c| c.name == added.column_name)
            {
                Some(column) => column.kind = added.column_kind.clone(),
                None => schema.columns.push(ColumnDescriptor {
                    name: added.column_name.clone(),
                    kind: added.column_kind.clone(),
                }),
            }
        }
    }
}
