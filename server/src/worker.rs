//! Headless worker: resumes every flow registered in the catalog and
//! runs it until the process receives a shutdown signal.

use std::sync::Arc;

use anyhow::Context;
use catalog::Catalog;
use flow::{CdcFlowWorkflow, FlowActivities, QRepFlowWorkflow};
use pt::FlowJobConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    All,
    /// Snapshot workers only take initial-copy QRep jobs, keeping bulk
    /// copies off the CDC task queue.
    SnapshotOnly,
}

pub async fn run(
    catalog: Arc<Catalog>,
    activities: Arc<dyn FlowActivities>,
    kind: WorkerKind,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let mut join_set: JoinSet<()> = JoinSet::new();

    let entries = catalog
        .get_flow_entries()
        .await
        .context("failed to list flows")?;
    info!("resuming {} flow(s) from the catalog", entries.len());

    for (name, config) in entries {
        let job: FlowJobConfig = match serde_json::from_value(config) {
            Ok(job) => job,
            Err(err) => {
                warn!("skipping flow {} with undecodable config: {}", name, err);
                continue;
            }
        };
        match (kind, job) {
            (WorkerKind::SnapshotOnly, FlowJobConfig::QRep(config))
                if config.initial_copy_only =>
            {
                spawn_qrep(&mut join_set, activities.clone(), &shutdown, config)
            }
            (WorkerKind::SnapshotOnly, _) => continue,
            (WorkerKind::All, FlowJobConfig::Cdc(config)) => {
                let workflow = CdcFlowWorkflow::new(
                    activities.clone(),
                    shutdown.child_token(),
                    Default::default(),
                );
                join_set.spawn(async move {
                    if let Err(err) = workflow.run(&config).await {
                        error!(flow = %config.flow_job_name, "cdc flow failed: {:#}", err);
                    }
                });
            }
            (WorkerKind::All, FlowJobConfig::QRep(config)) => {
                spawn_qrep(&mut join_set, activities.clone(), &shutdown, config)
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping flows");
    shutdown.cancel();
    while join_set.join_next().await.is_some() {}
    Ok(())
}

fn spawn_qrep(
    join_set: &mut JoinSet<()>,
    activities: Arc<dyn FlowActivities>,
    shutdown: &CancellationToken,
    config: pt::QRepConfig,
) {
    let workflow = QRepFlowWorkflow::new(activities, shutdown.child_token());
    join_set.spawn(async move {
        if let Err(err) = workflow.run(&config).await {
            error!(flow = %config.flow_job_name, "qrep flow failed: {:#}", err);
        }
    });
}
