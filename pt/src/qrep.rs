use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peers::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QRepSyncMode {
    MultiInsert,
    StorageAvro,
}

impl Default for QRepSyncMode {
    fn default() -> Self {
        QRepSyncMode::MultiInsert
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QRepWriteType {
    Append,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QRepWriteMode {
    pub write_type: QRepWriteType,
    pub upsert_key_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRepConfig {
    pub flow_job_name: String,
    pub source_peer: Peer,
    pub destination_peer: Peer,
    pub destination_table_identifier: String,
    /// Query with `{{.start}}` and `{{.end}}` placeholders substituted
    /// per partition.
    pub query: String,
    pub watermark_table: String,
    pub watermark_column: String,
    pub initial_copy_only: bool,
    pub sync_mode: QRepSyncMode,
    pub batch_size_int: u32,
    pub max_parallel_workers: u32,
    /// Time to wait between getting partitions to process.
    pub wait_between_batches_seconds: u32,
    pub write_mode: QRepWriteMode,
    /// Where Avro files are staged: `s3://`, `gs://` or a local path.
    pub staging_path: String,
    /// Overrides batch_size_int: bucket partitions by row count instead.
    pub num_rows_per_partition: u32,
}

/// A TID (ctid) position, used to partition tables without a usable
/// watermark column by physical block ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId {
    pub block_number: u32,
    pub offset_number: u16,
}

/// Partition bounds are inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionRange {
    Int {
        start: i64,
        end: i64,
    },
    Timestamp {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Tid {
        start: TupleId,
        end: TupleId,
    },
    /// A single partition covering the whole table.
    FullTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRepPartition {
    pub partition_id: String,
    pub range: PartitionRange,
    pub run_uuid: String,
}

impl QRepPartition {
    pub fn is_full_table(&self) -> bool {
        matches!(self.range, PartitionRange::FullTable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRepPartitionBatch {
    pub batch_id: u32,
    pub partitions: Vec<QRepPartition>,
}
