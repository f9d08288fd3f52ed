use std::collections::HashMap;
use std::time::Duration;

use pt::{
    LastSyncState, QRepSyncMode, RelationMessageMapping, TableSchema, TableSchemaDelta,
};
use serde::{Deserialize, Serialize};

use crate::records::RecordBatch;

pub struct PullRecordsRequest {
    pub flow_job_name: String,
    pub last_sync_state: Option<LastSyncState>,
    pub max_batch_size: u32,
    /// A batch closes when this much time passes with at least one
    /// record buffered.
    pub idle_timeout: Duration,
    pub src_table_id_name_mapping: HashMap<u32, String>,
    pub table_name_mapping: HashMap<String, String>,
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
    pub override_publication_name: Option<String>,
    pub override_replication_slot_name: Option<String>,
    pub relation_message_mapping: RelationMessageMapping,
}

/// Result of one pull: the batch plus the relation mapping to carry into
/// the next pull.
pub struct PullRecordsResult {
    pub record_batch: RecordBatch,
    pub relation_message_mapping: RelationMessageMapping,
}

pub struct SyncRecordsRequest {
    pub flow_job_name: String,
    pub records: RecordBatch,
    pub sync_mode: QRepSyncMode,
    pub staging_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub first_synced_checkpoint: i64,
    pub last_synced_checkpoint: i64,
    pub num_records_synced: u64,
    pub current_sync_batch_id: i64,
    pub table_name_rows_mapping: HashMap<String, u32>,
    pub table_schema_deltas: Vec<TableSchemaDelta>,
    pub relation_message_mapping: RelationMessageMapping,
}

pub struct NormalizeRecordsRequest {
    pub flow_job_name: String,
    pub soft_delete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeResponse {
    /// True when normalize has caught up with sync (including the
    /// no-work case).
    pub done: bool,
    pub start_batch_id: i64,
    pub end_batch_id: i64,
}
