//! Capability traits over peer types and the factories dispatching on
//! them. A backend missing a capability yields the
//! `UnsupportedFunctionality` sentinel; callers branch on it instead of
//! using errors for control flow.

use std::collections::HashMap;

use async_trait::async_trait;
use model::{
    NormalizeRecordsRequest, NormalizeResponse, PullRecordsRequest, PullRecordsResult,
    QRecordStreamReceiver, QRecordStreamSender, SyncRecordsRequest, SyncResponse,
};
use peer_postgres::PostgresConnector;
use peer_snowflake::SnowflakeConnector;
use pt::{
    LastSyncState, Peer, QRepConfig, QRepPartition, SetupNormalizedTableInput,
    SetupNormalizedTableOutput, SetupReplicationInput, SetupReplicationOutput, TableSchema,
    TableSchemaDelta,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("{peer_type} does not support {capability}")]
    UnsupportedFunctionality {
        peer_type: &'static str,
        capability: &'static str,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ConnectorError::UnsupportedFunctionality { .. })
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Source-side CDC capability.
#[async_trait]
pub trait CdcPullConnector: Send {
    async fn check_connection(&self) -> anyhow::Result<()>;

    async fn ensure_pullability(
        &self,
        source_table_identifiers: &[String],
    ) -> anyhow::Result<HashMap<String, u32>>;

    async fn get_table_schema(
        &self,
        table_identifiers: &[String],
    ) -> anyhow::Result<HashMap<String, TableSchema>>;

    async fn setup_replication(
        &self,
        req: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput>;

    async fn pull_records(
        &self,
        req: PullRecordsRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PullRecordsResult>;

    async fn send_wal_heartbeat(&self) -> anyhow::Result<()>;

    async fn pull_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()>;
}

/// Destination-side CDC landing capability.
#[async_trait]
pub trait CdcSyncConnector: Send {
    async fn check_connection(&self) -> anyhow::Result<()>;

    async fn needs_setup_metadata_tables(&self) -> bool;

    async fn setup_metadata_tables(&self) -> anyhow::Result<()>;

    async fn get_last_offset(&self, job_name: &str) -> anyhow::Result<Option<LastSyncState>>;

    async fn get_last_sync_batch_id(&self, job_name: &str) -> anyhow::Result<i64>;

    async fn create_raw_table(&self, flow_job_name: &str) -> anyhow::Result<String>;

    async fn setup_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput>;

    fn initialize_table_schema(
        &mut self,
        mapping: HashMap<String, TableSchema>,
    ) -> anyhow::Result<()>;

    async fn sync_records(&self, req: SyncRecordsRequest) -> anyhow::Result<SyncResponse>;

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()>;
}

/// Destination-side normalization capability.
#[async_trait]
pub trait CdcNormalizeConnector: Send {
    fn initialize_table_schema(
        &mut self,
        mapping: HashMap<String, TableSchema>,
    ) -> anyhow::Result<()>;

    async fn get_last_normalize_batch_id(&self, job_name: &str) -> anyhow::Result<i64>;

    async fn normalize_records(
        &self,
        req: &NormalizeRecordsRequest,
    ) -> anyhow::Result<NormalizeResponse>;

    async fn replay_table_schema_deltas(
        &self,
        flow_job_name: &str,
        deltas: &[TableSchemaDelta],
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait QRepPullConnector: Send {
    async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>>;

    async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        sender: QRecordStreamSender,
    ) -> anyhow::Result<u64>;

    async fn check_for_updated_max_value(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait QRepSyncConnector: Send {
    async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> anyhow::Result<()>;

    async fn is_qrep_partition_synced(
        &self,
        flow_job_name: &str,
        partition_id: &str,
    ) -> anyhow::Result<bool>;

    async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        stream: QRecordStreamReceiver,
    ) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait QRepConsolidateConnector: Send {
    async fn consolidate_qrep_partitions(&self, config: &QRepConfig) -> anyhow::Result<()>;

    async fn cleanup_qrep_flow(&self, flow_job_name: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl CdcPullConnector for PostgresConnector {
    async fn check_connection(&self) -> anyhow::Result<()> {
        PostgresConnector::check_connection(self).await
    }

    async fn ensure_pullability(
        &self,
        source_table_identifiers: &[String],
    ) -> anyhow::Result<HashMap<String, u32>> {
        PostgresConnector::ensure_pullability(self, source_table_identifiers).await
    }

    async fn get_table_schema(
        &self,
        table_identifiers: &[String],
    ) -> anyhow::Result<HashMap<String, TableSchema>> {
        PostgresConnector::get_table_schema(self, table_identifiers).await
    }

    async fn setup_replication(
        &self,
        req: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput> {
        PostgresConnector::setup_replication(self, req).await
    }

    async fn pull_records(
        &self,
        req: PullRecordsRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PullRecordsResult> {
        PostgresConnector::pull_records(self, req, cancel).await
    }

    async fn send_wal_heartbeat(&self) -> anyhow::Result<()> {
        PostgresConnector::send_wal_heartbeat(self).await
    }

    async fn pull_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()> {
        PostgresConnector::pull_flow_cleanup(self, flow_job_name).await
    }
}

#[async_trait]
impl QRepPullConnector for PostgresConnector {
    async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>> {
        PostgresConnector::get_qrep_partitions(self, config, last, run_uuid).await
    }

    async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        sender: QRecordStreamSender,
    ) -> anyhow::Result<u64> {
        PostgresConnector::pull_qrep_records(self, config, partition, sender).await
    }

    async fn check_for_updated_max_value(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> anyhow::Result<bool> {
        PostgresConnector::check_for_updated_max_value(self, config, last).await
    }
}

#[async_trait]
impl CdcSyncConnector for SnowflakeConnector {
    async fn check_connection(&self) -> anyhow::Result<()> {
        SnowflakeConnector::check_connection(self).await
    }

    async fn needs_setup_metadata_tables(&self) -> bool {
        SnowflakeConnector::needs_setup_metadata_tables(self).await
    }

    async fn setup_metadata_tables(&self) -> anyhow::Result<()> {
        SnowflakeConnector::setup_metadata_tables(self).await
    }

    async fn get_last_offset(&self, job_name: &str) -> anyhow::Result<Option<LastSyncState>> {
        SnowflakeConnector::get_last_offset(self, job_name).await
    }

    async fn get_last_sync_batch_id(&self, job_name: &str) -> anyhow::Result<i64> {
        SnowflakeConnector::get_last_sync_batch_id(self, job_name).await
    }

    async fn create_raw_table(&self, flow_job_name: &str) -> anyhow::Result<String> {
        SnowflakeConnector::create_raw_table(self, flow_job_name).await
    }

    async fn setup_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput> {
        SnowflakeConnector::setup_normalized_tables(self, input).await
    }

    fn initialize_table_schema(
        &mut self,
        mapping: HashMap<String, TableSchema>,
    ) -> anyhow::Result<()> {
        SnowflakeConnector::initialize_table_schema(self, mapping)
    }

    async fn sync_records(&self, req: SyncRecordsRequest) -> anyhow::Result<SyncResponse> {
        SnowflakeConnector::sync_records(self, req).await
    }

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()> {
        SnowflakeConnector::sync_flow_cleanup(self, flow_job_name).await
    }
}

#[async_trait]
impl CdcNormalizeConnector for SnowflakeConnector {
    fn initialize_table_schema(
        &mut self,
        mapping: HashMap<String, TableSchema>,
    ) -> anyhow::Result<()> {
        SnowflakeConnector::initialize_table_schema(self, mapping)
    }

    async fn get_last_normalize_batch_id(&self, job_name: &str) -> anyhow::Result<i64> {
        SnowflakeConnector::get_last_normalize_batch_id(self, job_name).await
    }

    async fn normalize_records(
        &self,
        req: &NormalizeRecordsRequest,
    ) -> anyhow::Result<NormalizeResponse> {
        SnowflakeConnector::normalize_records(self, req).await
    }

    async fn replay_table_schema_deltas(
        &self,
        flow_job_name: &str,
        deltas: &[TableSchemaDelta],
    ) -> anyhow::Result<()> {
        SnowflakeConnector::replay_table_schema_deltas(self, flow_job_name, deltas).await
    }
}

#[async_trait]
impl QRepSyncConnector for SnowflakeConnector {
    async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> anyhow::Result<()> {
        SnowflakeConnector::setup_qrep_metadata_tables(self, config).await
    }

    async fn is_qrep_partition_synced(
        &self,
        flow_job_name: &str,
        partition_id: &str,
    ) -> anyhow::Result<bool> {
        SnowflakeConnector::is_qrep_partition_synced(self, flow_job_name, partition_id).await
    }

    async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        stream: QRecordStreamReceiver,
    ) -> anyhow::Result<u64> {
        SnowflakeConnector::sync_qrep_records(self, config, partition, stream).await
    }
}

#[async_trait]
impl QRepConsolidateConnector for SnowflakeConnector {
    async fn consolidate_qrep_partitions(&self, config: &QRepConfig) -> anyhow::Result<()> {
        SnowflakeConnector::consolidate_qrep_partitions(self, config).await
    }

    async fn cleanup_qrep_flow(&self, flow_job_name: &str) -> anyhow::Result<()> {
        SnowflakeConnector::qrep_flow_cleanup(self, flow_job_name).await
    }
}

pub async fn get_cdc_pull_connector(peer: &Peer) -> ConnectorResult<Box<dyn CdcPullConnector>> {
    match peer.postgres_config() {
        Some(config) => Ok(Box::new(PostgresConnector::new(config).await?)),
        None => Err(ConnectorError::UnsupportedFunctionality {
            peer_type: peer.r#type.as_str_name(),
            capability: "CDC pull",
        }),
    }
}

pub async fn get_cdc_sync_connector(peer: &Peer) -> ConnectorResult<Box<dyn CdcSyncConnector>> {
    match peer.snowflake_config() {
        Some(config) => Ok(Box::new(SnowflakeConnector::new(config).await?)),
        None => Err(ConnectorError::UnsupportedFunctionality {
            peer_type: peer.r#type.as_str_name(),
            capability: "CDC sync",
        }),
    }
}

pub async fn get_cdc_normalize_connector(
    peer: &Peer,
) -> ConnectorResult<Box<dyn CdcNormalizeConnector>> {
    match peer.snowflake_config() {
        Some(config) => Ok(Box::new(SnowflakeConnector::new(config).await?)),
        None => Err(ConnectorError::UnsupportedFunctionality {
            peer_type: peer.r#type.as_str_name(),
            capability: "CDC normalize",
        }),
    }
}

pub async fn get_qrep_pull_connector(peer: &Peer) -> ConnectorResult<Box<dyn QRepPullConnector>> {
    match peer.postgres_config() {
        Some(config) => Ok(Box::new(PostgresConnector::new(config).await?)),
        None => Err(ConnectorError::UnsupportedFunctionality {
            peer_type: peer.r#type.as_str_name(),
            capability: "QRep pull",
        }),
    }
}

pub async fn get_qrep_sync_connector(peer: &Peer) -> ConnectorResult<Box<dyn QRepSyncConnector>> {
    match peer.snowflake_config() {
        Some(config) => Ok(Box::new(SnowflakeConnector::new(config).await?)),
        None => Err(ConnectorError::UnsupportedFunctionality {
            peer_type: peer.r#type.as_str_name(),
            capability: "QRep sync",
        }),
    }
}

pub async fn get_qrep_consolidate_connector(
    peer: &Peer,
) -> ConnectorResult<Box<dyn QRepConsolidateConnector>> {
    match peer.snowflake_config() {
        Some(config) => Ok(Box::new(SnowflakeConnector::new(config).await?)),
        None => Err(ConnectorError::UnsupportedFunctionality {
            peer_type: peer.r#type.as_str_name(),
            capability: "QRep consolidate",
        }),
    }
}
