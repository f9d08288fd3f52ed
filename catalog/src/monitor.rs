//! Mirror monitor: persists per-batch and per-partition progress into the
//! operational catalog. These writes are a monitoring side effect and run
//! in their own statements, never on the replication commit path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pt::{PartitionRange, QRepConfig, QRepPartition};

use crate::Catalog;

#[derive(Debug, Clone)]
pub struct CdcBatchInfo {
    pub batch_id: i64,
    pub rows_in_batch: i64,
    pub batch_start_lsn: i64,
    pub batch_end_lsn: i64,
    pub start_time: DateTime<Utc>,
}

/// Monitoring sink over the catalog. Inactive when no catalog is
/// configured; every write then becomes a no-op.
#[derive(Clone, Default)]
pub struct CatalogMirrorMonitor {
    catalog: Option<Arc<Catalog>>,
}

fn range_bound_text(range: &PartitionRange) -> (String, String) {
    match range {
        PartitionRange::Int { start, end } => (start.to_string(), end.to_string()),
        PartitionRange::Timestamp { start, end } => (start.to_rfc3339(), end.to_rfc3339()),
        PartitionRange::Tid { start, end } => (
            format!("({},{})", start.block_number, start.offset_number),
            format!("({},{})", end.block_number, end.offset_number),
        ),
        PartitionRange::FullTable => ("full".to_owned(), "full".to_owned()),
    }
}

impl CatalogMirrorMonitor {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Some(Arc::new(catalog)),
        }
    }

    pub fn from_shared(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog: Some(catalog),
        }
    }

    pub fn inactive() -> Self {
        Self { catalog: None }
    }

    pub fn is_active(&self) -> bool {
        self.catalog.is_some()
    }

    pub async fn initialize_cdc_flow(&self, flow_name: &str) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "INSERT INTO peerdb_stats.cdc_flows (flow_name) VALUES ($1) \
                 ON CONFLICT (flow_name) DO NOTHING",
                &[&flow_name],
            )
            .await
            .context("failed to initialize cdc flow stats")?;
        Ok(())
    }

    pub async fn add_cdc_batch_for_flow(
        &self,
        flow_name: &str,
        batch: CdcBatchInfo,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "INSERT INTO peerdb_stats.cdc_batches \
                 (flow_name, batch_id, rows_in_batch, batch_start_lsn, batch_end_lsn, start_time) \
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (flow_name, batch_id) DO NOTHING",
                &[
                    &flow_name,
                    &batch.batch_id,
                    &batch.rows_in_batch,
                    &batch.batch_start_lsn,
                    &batch.batch_end_lsn,
                    &batch.start_time,
                ],
            )
            .await
            .context("failed to insert cdc batch stats")?;
        Ok(())
    }

    pub async fn update_latest_lsn_at_target(
        &self,
        flow_name: &str,
        lsn: i64,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.cdc_flows SET latest_lsn_at_target = $2 WHERE flow_name = $1",
                &[&flow_name, &lsn],
            )
            .await
            .context("failed to update latest lsn at target")?;
        Ok(())
    }

    pub async fn add_cdc_batch_tables_for_flow(
        &self,
        flow_name: &str,
        batch_id: i64,
        table_name_rows_mapping: &HashMap<String, u32>,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        for (table_name, rows) in table_name_rows_mapping {
            catalog
                .client()
                .execute(
                    "INSERT INTO peerdb_stats.cdc_batch_table \
                     (flow_name, batch_id, destination_table_name, num_rows) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (flow_name, batch_id, destination_table_name) DO NOTHING",
                    &[&flow_name, &batch_id, table_name, &(*rows as i64)],
                )
                .await
                .context("failed to insert cdc batch table stats")?;
        }
        Ok(())
    }

    pub async fn update_end_time_for_cdc_batch(
        &self,
        flow_name: &str,
        batch_id: i64,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.cdc_batches SET end_time = now() \
                 WHERE flow_name = $1 AND batch_id <= $2 AND end_time IS NULL",
                &[&flow_name, &batch_id],
            )
            .await
            .context("failed to update cdc batch end time")?;
        Ok(())
    }

    /// Register a run and its partitions. A partition replayed after a
    /// failure keeps its row and bumps restart_count.
    pub async fn initialize_qrep_run(
        &self,
        config: &QRepConfig,
        run_uuid: &str,
        partitions: &[QRepPartition],
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "INSERT INTO peerdb_stats.qrep_runs (flow_name, run_uuid) VALUES ($1, $2) \
                 ON CONFLICT (flow_name, run_uuid) DO NOTHING",
                &[&config.flow_job_name.as_str(), &run_uuid],
            )
            .await
            .context("failed to insert qrep run")?;
        for partition in partitions {
            let (start, end) = range_bound_text(&partition.range);
            catalog
                .client()
                .execute(
                    "INSERT INTO peerdb_stats.qrep_partitions \
                     (flow_name, run_uuid, partition_uuid, partition_start, partition_end) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (run_uuid, partition_uuid) \
                     DO UPDATE SET restart_count = peerdb_stats.qrep_partitions.restart_count + 1",
                    &[
                        &config.flow_job_name.as_str(),
                        &run_uuid,
                        &partition.partition_id.as_str(),
                        &start,
                        &end,
                    ],
                )
                .await
                .context("failed to insert qrep partition")?;
        }
        Ok(())
    }

    pub async fn update_start_time_for_qrep_run(&self, run_uuid: &str) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.qrep_runs SET start_time = now() \
                 WHERE run_uuid = $1 AND start_time IS NULL",
                &[&run_uuid],
            )
            .await
            .context("failed to update qrep run start time")?;
        Ok(())
    }

    pub async fn update_start_time_for_partition(
        &self,
        run_uuid: &str,
        partition: &QRepPartition,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.qrep_partitions SET start_time = now() \
                 WHERE run_uuid = $1 AND partition_uuid = $2",
                &[&run_uuid, &partition.partition_id.as_str()],
            )
            .await
            .context("failed to update partition start time")?;
        Ok(())
    }

    pub async fn update_pull_end_time_and_rows_for_partition(
        &self,
        run_uuid: &str,
        partition: &QRepPartition,
        rows: i64,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.qrep_partitions \
                 SET pull_end_time = now(), rows_in_partition = $3 \
                 WHERE run_uuid = $1 AND partition_uuid = $2",
                &[&run_uuid, &partition.partition_id.as_str(), &rows],
            )
            .await
            .context("failed to update partition pull end time")?;
        Ok(())
    }

    pub async fn update_end_time_for_partition(
        &self,
        run_uuid: &str,
        partition: &QRepPartition,
    ) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.qrep_partitions SET end_time = now() \
                 WHERE run_uuid = $1 AND partition_uuid = $2",
                &[&run_uuid, &partition.partition_id.as_str()],
            )
            .await
            .context("failed to update partition end time")?;
        Ok(())
    }

    pub async fn update_end_time_for_qrep_run(&self, run_uuid: &str) -> anyhow::Result<()> {
        let Some(catalog) = &self.catalog else {
            return Ok(());
        };
        catalog
            .client()
            .execute(
                "UPDATE peerdb_stats.qrep_runs SET end_time = now() WHERE run_uuid = $1",
                &[&run_uuid],
            )
            .await
            .context("failed to update qrep run end time")?;
        Ok(())
    }
}
