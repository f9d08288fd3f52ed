use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peers::Peer;
use crate::qrep::{QRepConfig, QRepSyncMode};
use crate::schema::{ColumnKind, TableSchema, TableSchemaDelta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table_identifier: String,
    pub destination_table_identifier: String,
    pub partition_key: Option<String>,
}

/// Immutable per-job configuration, created by the control surface and
/// owned by the workflow instance for its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConnectionConfigs {
    pub source: Peer,
    pub destination: Peer,
    /// Globally unique job name.
    pub flow_job_name: String,
    pub table_mappings: Vec<TableMapping>,
    pub src_table_id_name_mapping: HashMap<u32, String>,
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
    pub max_batch_size: u32,
    pub do_initial_copy: bool,
    /// Adopt this publication instead of creating one.
    pub publication_name: Option<String>,
    /// Adopt this replication slot instead of creating one.
    pub replication_slot_name: Option<String>,
    pub snapshot_num_rows_per_partition: u32,
    /// Max parallel workers is per table.
    pub snapshot_max_parallel_workers: u32,
    pub snapshot_num_tables_in_parallel: u32,
    pub snapshot_sync_mode: QRepSyncMode,
    pub snapshot_staging_path: String,
    pub cdc_sync_mode: QRepSyncMode,
    pub cdc_staging_path: String,
    pub soft_delete: bool,
}

impl FlowConnectionConfigs {
    pub fn table_name_mapping(&self) -> HashMap<String, String> {
        self.table_mappings
            .iter()
            .map(|m| {
                (
                    m.source_table_identifier.clone(),
                    m.destination_table_identifier.clone(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncState {
    /// WAL LSN of the last record committed on the destination.
    pub checkpoint: i64,
}

/// Relation metadata decoded from the logical replication stream,
/// keyed by relation id in `RelationMessageMapping`. Carried across
/// continue-as-new boundaries so pulls resume with a warm cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub type_oid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub relation_name: String,
    pub columns: Vec<RelationColumn>,
}

pub type RelationMessageMapping = HashMap<u32, RelationMessage>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlowInput {
    pub flow_connection_configs: FlowConnectionConfigs,
    pub last_sync_state: Option<LastSyncState>,
    pub sync_flow_options: SyncFlowOptions,
    pub relation_message_mapping: RelationMessageMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFlowOptions {
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartNormalizeInput {
    pub flow_connection_configs: FlowConnectionConfigs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsurePullabilityInput {
    pub peer: Peer,
    pub flow_job_name: String,
    pub source_table_identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsurePullabilityOutput {
    /// Postgres relation id per source table.
    pub table_identifier_mapping: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupReplicationInput {
    pub peer: Peer,
    pub flow_job_name: String,
    pub table_name_mapping: HashMap<String, String>,
    pub existing_publication_name: Option<String>,
    pub existing_replication_slot_name: Option<String>,
    pub do_initial_copy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupReplicationOutput {
    pub slot_name: String,
    /// Exported snapshot for the initial copy; empty when the slot was
    /// adopted rather than created.
    pub snapshot_name: String,
    /// The slot's consistent point. The snapshot workflow copies rows as
    /// of this LSN and CDC consumption starts from it.
    pub consistent_point: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRawTableInput {
    pub peer: Peer,
    pub flow_job_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRawTableOutput {
    pub table_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTableSchemaInput {
    pub peer: Peer,
    pub table_identifiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupNormalizedTableInput {
    pub peer: Peer,
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
    /// Soft-delete flows need the deletion marker column on every
    /// normalized table.
    pub soft_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupNormalizedTableOutput {
    pub table_exists_mapping: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTableSchemaDeltaInput {
    pub flow_connection_configs: FlowConnectionConfigs,
    pub table_schema_deltas: Vec<TableSchemaDelta>,
}

/// Persisted shape of a flow job in the catalog; workers resume every
/// entry on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FlowJobConfig {
    Cdc(FlowConnectionConfigs),
    QRep(QRepConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub flow_job_name: String,
    pub workflow_id: String,
    pub source_peer: Peer,
    pub destination_peer: Peer,
}

/// Per-flow status surfaced through the workflow query interface and the
/// control surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdcFlowStatus {
    pub setup_complete: bool,
    pub normalize_flow_statuses: Vec<NormalizeFlowStatus>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeFlowStatus {
    pub start_batch_id: i64,
    pub end_batch_id: i64,
    pub finished_at: DateTime<Utc>,
}
