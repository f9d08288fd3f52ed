//! Initial-copy sub-flow: one QRep run per mapped table, bounded table
//! parallelism, executed against the snapshot exported by slot creation.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use pt::{FlowConnectionConfigs, QRepConfig, QRepWriteMode, QRepWriteType, TableMapping, TableSchema};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::activities::FlowActivities;
use crate::workflows::qrep_flow::QRepFlowWorkflow;

/// Copy every mapped table as of the consistent point. CDC consumption
/// must not cross this point before the copy completes; changes at or
/// after it are replayed by CDC and collapse under the idempotent merge.
pub async fn run(
    activities: &Arc<dyn FlowActivities>,
    configs: &FlowConnectionConfigs,
    snapshot_name: &str,
    consistent_point: i64,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    info!(
        flow = %configs.flow_job_name,
        "starting snapshot with snapshot {} at consistent point {}",
        snapshot_name, consistent_point
    );

    let tables_in_parallel = configs.snapshot_num_tables_in_parallel.max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(tables_in_parallel));
    let mut join_set: JoinSet<anyhow::Result<()>> = JoinSet::new();

    for mapping in &configs.table_mappings {
        let schema = configs
            .table_name_schema_mapping
            .get(&mapping.destination_table_identifier)
            .ok_or_else(|| {
                anyhow!(
                    "no schema for snapshot table {}",
                    mapping.destination_table_identifier
                )
            })?;
        let qrep_config = build_snapshot_qrep_config(configs, mapping, schema);

        let semaphore = semaphore.clone();
        let activities = activities.clone();
        let cancel = cancel.child_token();
        join_set.spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .context("snapshot semaphore closed")?;
            let workflow = QRepFlowWorkflow::new(activities, cancel);
            workflow.run(&qrep_config).await
        });
    }

    while let Some(result) = join_set.join_next().await {
        result.context("snapshot table task panicked")??;
    }
    info!(flow = %configs.flow_job_name, "snapshot complete");
    Ok(())
}

/// One QRep config per table: watermark on the primary key, TID ranges
/// when the table has no single-column key.
fn build_snapshot_qrep_config(
    configs: &FlowConnectionConfigs,
    mapping: &TableMapping,
    schema: &TableSchema,
) -> QRepConfig {
    let src = &mapping.source_table_identifier;
    let watermark_column = match mapping.partition_key.as_deref() {
        Some(key) if !key.is_empty() => key.to_owned(),
        _ => {
            if schema.primary_key_columns.len() == 1 {
                schema.primary_key_columns[0].clone()
            } else {
                "ctid".to_owned()
            }
        }
    };
    let query = format!(
        "SELECT * FROM {} WHERE {} BETWEEN {{{{.start}}}} AND {{{{.end}}}}",
        src, watermark_column
    );

    QRepConfig {
        flow_job_name: format!(
            "{}_snapshot_{}",
            configs.flow_job_name,
            src.replace('.', "_")
        ),
        source_peer: configs.source.clone(),
        destination_peer: configs.destination.clone(),
        destination_table_identifier: mapping.destination_table_identifier.clone(),
        query,
        watermark_table: src.clone(),
        watermark_column,
        initial_copy_only: true,
        sync_mode: configs.snapshot_sync_mode,
        batch_size_int: 0,
        max_parallel_workers: configs.snapshot_max_parallel_workers.max(1),
        wait_between_batches_seconds: 0,
        write_mode: QRepWriteMode {
            write_type: QRepWriteType::Append,
            upsert_key_columns: vec![],
        },
        staging_path: configs.snapshot_staging_path.clone(),
        num_rows_per_partition: configs.snapshot_num_rows_per_partition,
    }
}
