use std::collections::HashMap;

use anyhow::{anyhow, Context};
use model::{PullRecordsRequest, PullRecordsResult, QRecordStreamSender};
use postgres_connection::connect_postgres;
use postgres_connection::replication::{parse_lsn, ReplicationClient};
use pt::{
    ColumnDescriptor, PostgresConfig, QRepConfig, QRepPartition, SetupReplicationInput,
    SetupReplicationOutput, TableSchema,
};
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod cdc;
pub mod pgoutput;
pub mod qrep;
pub mod types;

/// Source connector speaking logical replication and watermark queries
/// against a Postgres peer.
pub struct PostgresConnector {
    config: PostgresConfig,
    client: Client,
}

impl PostgresConnector {
    pub async fn new(config: &PostgresConfig) -> anyhow::Result<Self> {
        let client = connect_postgres(config).await?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    pub async fn check_connection(&self) -> anyhow::Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .context("connection check failed")?;
        Ok(())
    }

    /// Verify each source table is an ordinary table whose changes can be
    /// replicated, returning its relation id.
    #[tracing::instrument(name = "peer_postgres::ensure_pullability", skip_all)]
    pub async fn ensure_pullability(
        &self,
        source_table_identifiers: &[String],
    ) -> anyhow::Result<HashMap<String, u32>> {
        let mut mapping = HashMap::with_capacity(source_table_identifiers.len());
        for table in source_table_identifiers {
            let row = self
                .client
                .query_opt(
                    "SELECT c.oid, c.relkind::text, c.relreplident::text \
                     FROM pg_class c WHERE c.oid = $1::regclass",
                    &[table],
                )
                .await
                .with_context(|| format!("failed to look up table {}", table))?
                .ok_or_else(|| anyhow!("table {} does not exist", table))?;

            let rel_id: u32 = row.get(0);
            let relkind: String = row.get(1);
            let replident: String = row.get(2);
            if relkind != "r" {
                return Err(anyhow!("{} is not an ordinary table", table));
            }
            if replident == "n" {
                return Err(anyhow!(
                    "{} has REPLICA IDENTITY NOTHING, updates and deletes cannot be replicated",
                    table
                ));
            }
            if replident == "d" && self.primary_key_columns(table).await?.is_empty() {
                return Err(anyhow!(
                    "{} has no primary key and no REPLICA IDENTITY FULL",
                    table
                ));
            }
            mapping.insert(table.clone(), rel_id);
        }
        Ok(mapping)
    }

    pub async fn get_table_schema(
        &self,
        table_identifiers: &[String],
    ) -> anyhow::Result<HashMap<String, TableSchema>> {
        let mut schemas = HashMap::with_capacity(table_identifiers.len());
        for table in table_identifiers {
            schemas.insert(table.clone(), self.table_schema(table).await?);
        }
        Ok(schemas)
    }

    async fn table_schema(&self, table: &str) -> anyhow::Result<TableSchema> {
        let rows = self
            .client
            .query(
                "SELECT a.attname, a.atttypid::oid FROM pg_attribute a \
                 WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&table],
            )
            .await
            .with_context(|| format!("failed to read columns of {}", table))?;
        let columns = rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.get(0),
                kind: types::column_kind_from_oid(row.get::<_, u32>(1)),
            })
            .collect();

        let replident: String = self
            .client
            .query_one(
                "SELECT relreplident::text FROM pg_class WHERE oid = $1::regclass",
                &[&table],
            )
            .await?
            .get(0);

        Ok(TableSchema {
            table_identifier: table.to_owned(),
            columns,
            primary_key_columns: self.primary_key_columns(table).await?,
            is_replica_identity_full: replident == "f",
        })
    }

    async fn primary_key_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = $1::regclass AND i.indisprimary",
                &[&table],
            )
            .await
            .with_context(|| format!("failed to read primary key of {}", table))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Adopt or create the publication and the logical slot for a job.
    /// Creation exports a snapshot for the initial copy; adoption leaves
    /// the existing objects untouched and returns no snapshot.
    #[tracing::instrument(name = "peer_postgres::setup_replication", skip_all, fields(job = %req.flow_job_name))]
    pub async fn setup_replication(
        &self,
        req: &SetupReplicationInput,
    ) -> anyhow::Result<SetupReplicationOutput> {
        match req.existing_publication_name.as_deref() {
            Some(name) if !name.is_empty() => {
                if !self.publication_exists(name).await? {
                    return Err(anyhow!("publication {} does not exist", name));
                }
            }
            _ => {
                let name = publication_name_for_job(&req.flow_job_name);
                if !self.publication_exists(&name).await? {
                    let tables: Vec<&str> =
                        req.table_name_mapping.keys().map(String::as_str).collect();
                    self.client
                        .simple_query(&format!(
                            "CREATE PUBLICATION {} FOR TABLE {}",
                            name,
                            tables.join(", ")
                        ))
                        .await
                        .context("failed to create publication")?;
                    info!("created publication {}", name);
                }
            }
        }

        match req.existing_replication_slot_name.as_deref() {
            Some(name) if !name.is_empty() => {
                let confirmed = self
                    .slot_confirmed_flush_lsn(name)
                    .await?
                    .ok_or_else(|| anyhow!("replication slot {} does not exist", name))?;
                Ok(SetupReplicationOutput {
                    slot_name: name.to_owned(),
                    snapshot_name: String::new(),
                    consistent_point: confirmed,
                })
            }
            _ => {
                let name = slot_name_for_job(&req.flow_job_name);
                if let Some(confirmed) = self.slot_confirmed_flush_lsn(&name).await? {
                    // a previous attempt already created the slot
                    return Ok(SetupReplicationOutput {
                        slot_name: name,
                        snapshot_name: String::new(),
                        consistent_point: confirmed,
                    });
                }
                let mut replication = ReplicationClient::connect(&self.config).await?;
                let slot = replication.create_logical_replication_slot(&name).await?;
                info!(
                    "created replication slot {} at {}, snapshot {}",
                    slot.slot_name,
                    postgres_connection::replication::format_lsn(slot.consistent_point),
                    slot.snapshot_name
                );
                Ok(SetupReplicationOutput {
                    slot_name: slot.slot_name,
                    snapshot_name: slot.snapshot_name,
                    consistent_point: slot.consistent_point,
                })
            }
        }
    }

    /// Pull one batch of commit-closed records from the slot.
    #[tracing::instrument(name = "peer_postgres::pull_records", skip_all, fields(job = %req.flow_job_name))]
    pub async fn pull_records(
        &self,
        req: PullRecordsRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PullRecordsResult> {
        let slot_name = req
            .override_replication_slot_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slot_name_for_job(&req.flow_job_name));
        let publication_name = req
            .override_publication_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| publication_name_for_job(&req.flow_job_name));
        let start_lsn = req.last_sync_state.map(|s| s.checkpoint).unwrap_or(0);

        let replication = ReplicationClient::connect(&self.config).await?;
        let stream = replication
            .start_replication(&slot_name, &publication_name, start_lsn)
            .await?;

        cdc::CdcPull::new(stream, &req).pull(cancel).await
    }

    /// No-op logical message keeping the slot alive when there is no CDC
    /// traffic.
    pub async fn send_wal_heartbeat(&self) -> anyhow::Result<()> {
        self.client
            .simple_query("SELECT pg_logical_emit_message(false, 'peerdb_heartbeat', now()::text)")
            .await
            .context("failed to emit WAL heartbeat")?;
        Ok(())
    }

    /// Drop the job-owned slot and publication. Adopted objects carry
    /// user-chosen names and are left intact.
    pub async fn pull_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()> {
        let slot = slot_name_for_job(flow_job_name);
        self.client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
                 WHERE slot_name = $1",
                &[&slot],
            )
            .await
            .context("failed to drop replication slot")?;
        self.client
            .simple_query(&format!(
                "DROP PUBLICATION IF EXISTS {}",
                publication_name_for_job(flow_job_name)
            ))
            .await
            .context("failed to drop publication")?;
        Ok(())
    }

    pub async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
        run_uuid: &str,
    ) -> anyhow::Result<Vec<QRepPartition>> {
        qrep::get_qrep_partitions(&self.client, config, last, run_uuid).await
    }

    pub async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        sender: QRecordStreamSender,
    ) -> anyhow::Result<u64> {
        qrep::pull_qrep_records(&self.client, config, partition, sender).await
    }

    pub async fn check_for_updated_max_value(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> anyhow::Result<bool> {
        qrep::check_for_updated_max_value(&self.client, config, last).await
    }

    async fn publication_exists(&self, name: &str) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&name])
            .await?;
        Ok(row.is_some())
    }

    async fn slot_confirmed_flush_lsn(&self, name: &str) -> anyhow::Result<Option<i64>> {
        let row = self
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await?;
        row.map(|r| parse_lsn(r.get::<_, String>(0).as_str()))
            .transpose()
    }
}

pub fn slot_name_for_job(flow_job_name: &str) -> String {
    format!("peerflow_slot_{}", sanitize_identifier(flow_job_name))
}

pub fn publication_name_for_job(flow_job_name: &str) -> String {
    format!("peerflow_pub_{}", sanitize_identifier(flow_job_name))
}

fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
