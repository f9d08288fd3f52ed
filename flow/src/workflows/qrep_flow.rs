//! QRep choreography: discover partitions, replicate them with bounded
//! parallelism, consolidate, then either finish (initial copy) or wait
//! for new rows and continue-as-new.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pt::{QRepConfig, QRepPartition, QRepPartitionBatch};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::activities::FlowActivities;
use crate::orchestrator::{execute_activity, ActivityOptions};
use crate::workflows::ended_by_shutdown;

const REPLICATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QRepFlowState {
    pub last_partition: Option<QRepPartition>,
    pub num_partitions_processed: u64,
}

pub enum QRepFlowOutcome {
    ContinueAsNew(Box<QRepFlowState>),
    Finished,
}

pub struct QRepFlowWorkflow {
    activities: Arc<dyn FlowActivities>,
    shutdown: CancellationToken,
}

impl QRepFlowWorkflow {
    pub fn new(activities: Arc<dyn FlowActivities>, shutdown: CancellationToken) -> Self {
        Self {
            activities,
            shutdown,
        }
    }

    pub async fn run(&self, config: &QRepConfig) -> anyhow::Result<()> {
        execute_activity(ActivityOptions::default(), &self.shutdown, |_ctx| {
            let activities = self.activities.clone();
            let config = config.clone();
            async move { activities.setup_qrep_metadata_tables(&config).await }
        })
        .await
        .context("failed to setup qrep metadata tables")?;

        let mut state = QRepFlowState::default();
        loop {
            match self.run_once(config, &mut state).await? {
                QRepFlowOutcome::ContinueAsNew(next) => state = *next,
                QRepFlowOutcome::Finished => return Ok(()),
            }
        }
    }

    async fn run_once(
        &self,
        config: &QRepConfig,
        state: &mut QRepFlowState,
    ) -> anyhow::Result<QRepFlowOutcome> {
        if self.shutdown.is_cancelled() {
            return Ok(QRepFlowOutcome::Finished);
        }

        let run_uuid = execute_activity(ActivityOptions::default(), &self.shutdown, |_ctx| {
            let activities = self.activities.clone();
            async move { activities.generate_run_uuid().await }
        })
        .await
        .context("failed to generate run id")?;

        let partitions = execute_activity(
            ActivityOptions::with_heartbeat(Duration::from_secs(15 * 60), Duration::from_secs(120)),
            &self.shutdown,
            |ctx| {
                let activities = self.activities.clone();
                let config = config.clone();
                let last = state.last_partition.clone();
                let run_uuid = run_uuid.clone();
                async move {
                    activities
                        .get_qrep_partitions(&ctx, &config, last.as_ref(), &run_uuid)
                        .await
                }
            },
        )
        .await
        .context("failed to get partitions")?;

        if !partitions.is_empty() {
            info!(
                flow = %config.flow_job_name,
                "replicating {} partition(s) for run {}",
                partitions.len(), run_uuid
            );
            self.replicate_partitions(config, &partitions, &run_uuid)
                .await?;

            execute_activity(
                ActivityOptions::with_heartbeat(
                    Duration::from_secs(30 * 60),
                    Duration::from_secs(120),
                ),
                &self.shutdown,
                |ctx| {
                    let activities = self.activities.clone();
                    let config = config.clone();
                    let run_uuid = run_uuid.clone();
                    async move {
                        activities
                            .consolidate_qrep_partitions(&ctx, &config, &run_uuid)
                            .await
                    }
                },
            )
            .await
            .context("failed to consolidate partitions")?;

            state.last_partition = partitions.last().cloned();
            state.num_partitions_processed += partitions.len() as u64;
        }

        if config.initial_copy_only {
            execute_activity(ActivityOptions::default(), &self.shutdown, |_ctx| {
                let activities = self.activities.clone();
                let config = config.clone();
                async move { activities.cleanup_qrep_flow(&config).await }
            })
            .await
            .context("failed to cleanup qrep flow")?;
            return Ok(QRepFlowOutcome::Finished);
        }

        let wait_result = execute_activity(
            // the wait loop heartbeats on every poll attempt
            ActivityOptions::with_heartbeat(
                Duration::from_secs(24 * 60 * 60),
                Duration::from_secs(
                    (config.wait_between_batches_seconds.max(5) as u64) * 4,
                ),
            ),
            &self.shutdown,
            |ctx| {
                let activities = self.activities.clone();
                let config = config.clone();
                let last = state.last_partition.clone();
                async move {
                    activities
                        .qrep_wait_until_new_rows(&ctx, &config, last.as_ref())
                        .await
                }
            },
        )
        .await;
        match wait_result {
            Ok(()) => {}
            Err(err) if ended_by_shutdown(&err) => return Ok(QRepFlowOutcome::Finished),
            Err(err) => return Err(err).context("failed waiting for new rows"),
        }

        Ok(QRepFlowOutcome::ContinueAsNew(Box::new(state.clone())))
    }

    /// Partitions are disjoint, so batches replicate in parallel; each
    /// batch runs as its own partition workflow.
    async fn replicate_partitions(
        &self,
        config: &QRepConfig,
        partitions: &[QRepPartition],
        run_uuid: &str,
    ) -> anyhow::Result<()> {
        let workers = config.max_parallel_workers.max(1) as usize;
        let batch_size = partitions.len().div_ceil(workers);
        let mut join_set: JoinSet<anyhow::Result<()>> = JoinSet::new();

        for (idx, chunk) in partitions.chunks(batch_size).enumerate() {
            let batch = QRepPartitionBatch {
                batch_id: (idx + 1) as u32,
                partitions: chunk.to_vec(),
            };
            let activities = self.activities.clone();
            let config = config.clone();
            let run_uuid = run_uuid.to_owned();
            let cancel = self.shutdown.child_token();
            join_set.spawn(async move {
                execute_activity(
                    ActivityOptions::with_heartbeat(REPLICATE_TIMEOUT, Duration::from_secs(120)),
                    &cancel,
                    |ctx| {
                        let activities = activities.clone();
                        let config = config.clone();
                        let batch = batch.clone();
                        let run_uuid = run_uuid.clone();
                        async move {
                            activities
                                .replicate_qrep_partitions(&ctx, &config, &batch, &run_uuid)
                                .await
                        }
                    },
                )
                .await
                .map_err(anyhow::Error::from)
            });
        }

        while let Some(result) = join_set.join_next().await {
            result.context("partition workflow panicked")??;
        }
        Ok(())
    }
}
