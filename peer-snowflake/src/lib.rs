use std::collections::HashMap;

use anyhow::{anyhow, Context};
use chrono::Utc;
use model::{
    FlowError, NormalizeRecordsRequest, NormalizeResponse, Record, RecordItems,
    SyncRecordsRequest, SyncResponse,
};
use pt::{
    LastSyncState, SetupNormalizedTableInput, SetupNormalizedTableOutput, SnowflakeConfig,
    TableSchema, TableSchemaDelta,
};
use tracing::{info, warn};
use uuid::Uuid;

pub mod auth;
pub mod avro;
pub mod client;
pub mod merge;
pub mod qrep;

use client::SqlApiClient;
use merge::{
    generate_create_normalized_table_sql, generate_distinct_table_names_sql,
    generate_merge_statement, get_raw_table_identifier, quote_literal, snowflake_type_for,
    MIRROR_JOBS_TABLE, PEERDB_INTERNAL_SCHEMA, QREP_PARTITIONS_TABLE,
};

const SYNC_RECORDS_CHUNK_SIZE: usize = 1024;

/// Destination connector landing CDC records in a raw table and merging
/// them into normalized tables over the Snowflake SQL API.
pub struct SnowflakeConnector {
    client: SqlApiClient,
    table_schema_mapping: HashMap<String, TableSchema>,
}

struct SnowflakeRawRecord {
    uid: String,
    timestamp: i64,
    destination_table_name: String,
    data: String,
    record_type: i32,
    match_data: Option<String>,
    batch_id: i64,
}

fn items_to_json(items: &RecordItems) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = items
        .iter()
        .map(|(name, value)| (name.clone(), value.to_serde_json_value()))
        .collect();
    serde_json::Value::Object(map)
}

impl SnowflakeConnector {
    pub async fn new(config: &SnowflakeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: SqlApiClient::new(config)?,
            table_schema_mapping: HashMap::new(),
        })
    }

    pub async fn check_connection(&self) -> anyhow::Result<()> {
        self.client.execute("SELECT 1").await?;
        Ok(())
    }

    pub fn initialize_table_schema(
        &mut self,
        mapping: HashMap<String, TableSchema>,
    ) -> anyhow::Result<()> {
        self.table_schema_mapping = mapping;
        Ok(())
    }

    pub async fn needs_setup_metadata_tables(&self) -> bool {
        match self
            .table_exists(PEERDB_INTERNAL_SCHEMA, MIRROR_JOBS_TABLE)
            .await
        {
            Ok(exists) => !exists,
            Err(_) => true,
        }
    }

    pub async fn setup_metadata_tables(&self) -> anyhow::Result<()> {
        self.client
            .execute_transaction(&[
                format!(
                    "CREATE TRANSIENT SCHEMA IF NOT EXISTS {}",
                    PEERDB_INTERNAL_SCHEMA
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {}.{}(MIRROR_JOB_NAME STRING NOT NULL,\
                     OFFSET INT NOT NULL,SYNC_BATCH_ID INT NOT NULL,NORMALIZE_BATCH_ID INT NOT NULL)",
                    PEERDB_INTERNAL_SCHEMA, MIRROR_JOBS_TABLE
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {}.{}(FLOW_JOB_NAME STRING NOT NULL,\
                     PARTITION_UUID STRING NOT NULL,RUN_UUID STRING NOT NULL,\
                     ROWS_SYNCED INT NOT NULL,SYNC_FINISH_TIME TIMESTAMP_NTZ NOT NULL)",
                    PEERDB_INTERNAL_SCHEMA, QREP_PARTITIONS_TABLE
                ),
            ])
            .await
            .context("failed to set up metadata tables")
    }

    /// `None` means no sync has happened for the job yet; a stored offset
    /// of zero is treated the same way.
    pub async fn get_last_offset(&self, job_name: &str) -> anyhow::Result<Option<LastSyncState>> {
        let offset = self
            .client
            .query_scalar_i64(&format!(
                "SELECT OFFSET FROM {}.{} WHERE MIRROR_JOB_NAME={}",
                PEERDB_INTERNAL_SCHEMA,
                MIRROR_JOBS_TABLE,
                quote_literal(job_name)
            ))
            .await?;
        Ok(match offset {
            None | Some(0) => None,
            Some(checkpoint) => Some(LastSyncState { checkpoint }),
        })
    }

    pub async fn get_last_sync_batch_id(&self, job_name: &str) -> anyhow::Result<i64> {
        Ok(self
            .client
            .query_scalar_i64(&format!(
                "SELECT SYNC_BATCH_ID FROM {}.{} WHERE MIRROR_JOB_NAME={}",
                PEERDB_INTERNAL_SCHEMA,
                MIRROR_JOBS_TABLE,
                quote_literal(job_name)
            ))
            .await?
            .unwrap_or(0))
    }

    pub async fn get_last_normalize_batch_id(&self, job_name: &str) -> anyhow::Result<i64> {
        Ok(self
            .client
            .query_scalar_i64(&format!(
                "SELECT NORMALIZE_BATCH_ID FROM {}.{} WHERE MIRROR_JOB_NAME={}",
                PEERDB_INTERNAL_SCHEMA,
                MIRROR_JOBS_TABLE,
                quote_literal(job_name)
            ))
            .await?
            .unwrap_or(0))
    }

    pub async fn create_raw_table(&self, flow_job_name: &str) -> anyhow::Result<String> {
        let raw_table = get_raw_table_identifier(flow_job_name);
        self.client
            .execute_transaction(&[
                format!(
                    "CREATE TRANSIENT SCHEMA IF NOT EXISTS {}",
                    PEERDB_INTERNAL_SCHEMA
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {}.{}(_PEERDB_UID STRING NOT NULL,\
                     _PEERDB_TIMESTAMP INT NOT NULL,_PEERDB_DESTINATION_TABLE_NAME STRING NOT NULL,\
                     _PEERDB_DATA STRING NOT NULL,_PEERDB_RECORD_TYPE INTEGER NOT NULL,\
                     _PEERDB_MATCH_DATA STRING,_PEERDB_BATCH_ID INT)",
                    PEERDB_INTERNAL_SCHEMA, raw_table
                ),
            ])
            .await
            .context("failed to create raw table")?;
        Ok(raw_table)
    }

    pub async fn setup_normalized_tables(
        &self,
        input: &SetupNormalizedTableInput,
    ) -> anyhow::Result<SetupNormalizedTableOutput> {
        let mut table_exists_mapping = HashMap::new();
        for (table_identifier, schema) in &input.table_name_schema_mapping {
            let (schema_name, table_name) = parse_table_name(table_identifier)?;
            let exists = self.table_exists(&schema_name, &table_name).await?;
            if !exists {
                let sql = generate_create_normalized_table_sql(
                    table_identifier,
                    schema,
                    input.soft_delete,
                );
                self.client.execute(&sql).await.with_context(|| {
                    format!("failed to create normalized table {}", table_identifier)
                })?;
            }
            table_exists_mapping.insert(table_identifier.clone(), exists);
        }
        Ok(SetupNormalizedTableOutput {
            table_exists_mapping,
        })
    }

    /// Land a batch in the raw table and advance sync metadata, all in one
    /// transaction. The batch id reservation only becomes durable at
    /// commit, so a retry of the whole call is safe.
    #[tracing::instrument(name = "peer_sflake::sync_records", skip_all, fields(job = %req.flow_job_name))]
    pub async fn sync_records(&self, req: SyncRecordsRequest) -> anyhow::Result<SyncResponse> {
        let raw_table = get_raw_table_identifier(&req.flow_job_name);
        let sync_batch_id = self.get_last_sync_batch_id(&req.flow_job_name).await? + 1;

        let mut table_name_rows_mapping: HashMap<String, u32> = HashMap::new();
        let mut raw_records = Vec::with_capacity(req.records.records.len());
        for record in &req.records.records {
            raw_records.push(to_raw_record(record, sync_batch_id)?);
            *table_name_rows_mapping
                .entry(record.destination_table_name().to_owned())
                .or_insert(0) += 1;
        }

        if raw_records.is_empty() {
            return Ok(SyncResponse::default());
        }
        info!(
            "pushing {} records to {}.{}",
            raw_records.len(),
            PEERDB_INTERNAL_SCHEMA,
            raw_table
        );

        let last_checkpoint = req.records.last_checkpoint;
        let mut statements: Vec<String> = raw_records
            .chunks(SYNC_RECORDS_CHUNK_SIZE)
            .map(|chunk| generate_raw_insert_sql(&raw_table, chunk))
            .collect();
        statements.push(
            self.sync_metadata_statement(&req.flow_job_name, last_checkpoint, sync_batch_id)
                .await?,
        );
        self.client
            .execute_transaction(&statements)
            .await
            .context("failed to sync records")?;

        Ok(SyncResponse {
            first_synced_checkpoint: req.records.first_checkpoint,
            last_synced_checkpoint: last_checkpoint,
            num_records_synced: raw_records.len() as u64,
            current_sync_batch_id: sync_batch_id,
            table_name_rows_mapping,
            table_schema_deltas: req.records.schema_deltas.clone(),
            relation_message_mapping: HashMap::new(),
        })
    }

    /// Merge raw rows of `(normalize_batch_id, sync_batch_id]` into the
    /// normalized tables and advance normalize metadata, atomically.
    #[tracing::instrument(name = "peer_sflake::normalize_records", skip_all, fields(job = %req.flow_job_name))]
    pub async fn normalize_records(
        &self,
        req: &NormalizeRecordsRequest,
    ) -> anyhow::Result<NormalizeResponse> {
        let sync_batch_id = self.get_last_sync_batch_id(&req.flow_job_name).await?;
        let normalize_batch_id = self.get_last_normalize_batch_id(&req.flow_job_name).await?;
        // normalize has caught up with sync, nothing to do
        if sync_batch_id == normalize_batch_id {
            return Ok(NormalizeResponse {
                done: true,
                start_batch_id: normalize_batch_id,
                end_batch_id: sync_batch_id,
            });
        }
        if !self.job_metadata_exists(&req.flow_job_name).await? {
            return Ok(NormalizeResponse {
                done: true,
                ..Default::default()
            });
        }

        let raw_table = get_raw_table_identifier(&req.flow_job_name);
        let destination_tables = self
            .client
            .query_column_strings(&generate_distinct_table_names_sql(
                &raw_table,
                normalize_batch_id,
                sync_batch_id,
            ))
            .await?;

        let mut statements = Vec::with_capacity(destination_tables.len() + 1);
        for destination_table in &destination_tables {
            let schema = self
                .table_schema_mapping
                .get(destination_table)
                .ok_or_else(|| {
                    FlowError::FailedPrecondition(format!(
                        "no schema initialized for table {}",
                        destination_table
                    ))
                })?;
            statements.push(generate_merge_statement(
                destination_table,
                &raw_table,
                schema,
                normalize_batch_id,
                sync_batch_id,
                req.soft_delete,
            ));
        }
        statements.push(format!(
            "UPDATE {}.{} SET NORMALIZE_BATCH_ID={} WHERE MIRROR_JOB_NAME={}",
            PEERDB_INTERNAL_SCHEMA,
            MIRROR_JOBS_TABLE,
            sync_batch_id,
            quote_literal(&req.flow_job_name)
        ));
        self.client
            .execute_transaction(&statements)
            .await
            .context("failed to normalize records")?;

        Ok(NormalizeResponse {
            done: true,
            start_batch_id: normalize_batch_id + 1,
            end_batch_id: sync_batch_id,
        })
    }

    /// Destination columns only ever grow: added source columns appear,
    /// removals are not propagated.
    pub async fn replay_table_schema_deltas(
        &self,
        _flow_job_name: &str,
        deltas: &[TableSchemaDelta],
    ) -> anyhow::Result<()> {
        for delta in deltas {
            for column in &delta.added_columns {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    delta.dst_table_name,
                    column.column_name.to_uppercase(),
                    snowflake_type_for(&column.column_kind)
                );
                self.client.execute(&sql).await.with_context(|| {
                    format!(
                        "failed to add column {} to {}",
                        column.column_name, delta.dst_table_name
                    )
                })?;
                info!(
                    "replayed schema delta on {}: added {}",
                    delta.dst_table_name, column.column_name
                );
            }
        }
        Ok(())
    }

    /// Drop the raw table and the job's metadata rows.
    pub async fn sync_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()> {
        self.client
            .execute_transaction(&[
                format!(
                    "DROP TABLE IF EXISTS {}.{}",
                    PEERDB_INTERNAL_SCHEMA,
                    get_raw_table_identifier(flow_job_name)
                ),
                format!(
                    "DELETE FROM {}.{} WHERE MIRROR_JOB_NAME={}",
                    PEERDB_INTERNAL_SCHEMA,
                    MIRROR_JOBS_TABLE,
                    quote_literal(flow_job_name)
                ),
                format!(
                    "DELETE FROM {}.{} WHERE FLOW_JOB_NAME={}",
                    PEERDB_INTERNAL_SCHEMA,
                    QREP_PARTITIONS_TABLE,
                    quote_literal(flow_job_name)
                ),
            ])
            .await
            .context("failed to clean up sync flow")
    }

    async fn sync_metadata_statement(
        &self,
        flow_job_name: &str,
        last_checkpoint: i64,
        sync_batch_id: i64,
    ) -> anyhow::Result<String> {
        Ok(if self.job_metadata_exists(flow_job_name).await? {
            format!(
                "UPDATE {}.{} SET OFFSET={},SYNC_BATCH_ID={} WHERE MIRROR_JOB_NAME={}",
                PEERDB_INTERNAL_SCHEMA,
                MIRROR_JOBS_TABLE,
                last_checkpoint,
                sync_batch_id,
                quote_literal(flow_job_name)
            )
        } else {
            format!(
                "INSERT INTO {}.{} VALUES ({},{},{},0)",
                PEERDB_INTERNAL_SCHEMA,
                MIRROR_JOBS_TABLE,
                quote_literal(flow_job_name),
                last_checkpoint,
                sync_batch_id
            )
        })
    }

    async fn job_metadata_exists(&self, flow_job_name: &str) -> anyhow::Result<bool> {
        self.client
            .query_scalar_bool(&format!(
                "SELECT TO_BOOLEAN(COUNT(1)) FROM {}.{} WHERE MIRROR_JOB_NAME={}",
                PEERDB_INTERNAL_SCHEMA,
                MIRROR_JOBS_TABLE,
                quote_literal(flow_job_name)
            ))
            .await
    }

    async fn table_exists(&self, schema_name: &str, table_name: &str) -> anyhow::Result<bool> {
        self.client
            .query_scalar_bool(&format!(
                "SELECT TO_BOOLEAN(COUNT(1)) FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA={} AND TABLE_NAME={}",
                quote_literal(&schema_name.to_uppercase()),
                quote_literal(&table_name.to_uppercase())
            ))
            .await
    }

    pub(crate) fn client(&self) -> &SqlApiClient {
        &self.client
    }
}

fn to_raw_record(record: &Record, batch_id: i64) -> anyhow::Result<SnowflakeRawRecord> {
    let timestamp = Utc::now()
        .timestamp_nanos_opt()
        .ok_or_else(|| anyhow!("timestamp out of range"))?;
    let uid = Uuid::new_v4().to_string();
    Ok(match record {
        Record::Insert {
            destination_table_name,
            items,
            ..
        } => SnowflakeRawRecord {
            uid,
            timestamp,
            destination_table_name: destination_table_name.clone(),
            data: items_to_json(items).to_string(),
            record_type: 0,
            match_data: None,
            batch_id,
        },
        Record::Update {
            destination_table_name,
            old_items,
            new_items,
            ..
        } => SnowflakeRawRecord {
            uid,
            timestamp,
            destination_table_name: destination_table_name.clone(),
            data: items_to_json(new_items).to_string(),
            record_type: 1,
            match_data: Some(items_to_json(old_items).to_string()),
            batch_id,
        },
        Record::Delete {
            destination_table_name,
            items,
            ..
        } => SnowflakeRawRecord {
            uid,
            timestamp,
            destination_table_name: destination_table_name.clone(),
            data: items_to_json(items).to_string(),
            record_type: 2,
            match_data: Some(items_to_json(items).to_string()),
            batch_id,
        },
    })
}

fn generate_raw_insert_sql(raw_table: &str, records: &[SnowflakeRawRecord]) -> String {
    let rows: Vec<String> = records
        .iter()
        .map(|r| {
            format!(
                "({},{},{},{},{},{},{})",
                quote_literal(&r.uid),
                r.timestamp,
                quote_literal(&r.destination_table_name),
                quote_literal(&r.data),
                r.record_type,
                r.match_data
                    .as_deref()
                    .map(quote_literal)
                    .unwrap_or_else(|| "NULL".to_owned()),
                r.batch_id
            )
        })
        .collect();
    format!(
        "INSERT INTO {}.{} VALUES{}",
        PEERDB_INTERNAL_SCHEMA,
        raw_table,
        rows.join(",")
    )
}

fn parse_table_name(table_identifier: &str) -> anyhow::Result<(String, String)> {
    match table_identifier.split_once('.') {
        Some((schema, table)) => Ok((schema.to_owned(), table.to_owned())),
        None => {
            warn!(
                "table {} is unqualified, assuming schema PUBLIC",
                table_identifier
            );
            Ok(("PUBLIC".to_owned(), table_identifier.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use value::Value;

    fn insert_record() -> Record {
        let mut items = RecordItems::new();
        items.insert("id".to_owned(), Value::Integer(1));
        items.insert("v".to_owned(), Value::Text("a".to_owned()));
        Record::Insert {
            checkpoint: 10,
            destination_table_name: "PUBLIC.T".to_owned(),
            items,
        }
    }

    #[test]
    fn raw_record_types_follow_the_wire_contract() {
        let insert = to_raw_record(&insert_record(), 3).unwrap();
        assert_eq!(insert.record_type, 0);
        assert!(insert.match_data.is_none());
        assert_eq!(insert.batch_id, 3);

        let mut old_items = RecordItems::new();
        old_items.insert("id".to_owned(), Value::Integer(1));
        let mut new_items = RecordItems::new();
        new_items.insert("id".to_owned(), Value::Integer(1));
        new_items.insert("v".to_owned(), Value::Text("b".to_owned()));
        let update = to_raw_record(
            &Record::Update {
                checkpoint: 11,
                destination_table_name: "PUBLIC.T".to_owned(),
                old_items,
                new_items,
            },
            3,
        )
        .unwrap();
        assert_eq!(update.record_type, 1);
        assert_eq!(update.match_data.as_deref(), Some(r#"{"id":1}"#));

        let mut items = RecordItems::new();
        items.insert("id".to_owned(), Value::Integer(1));
        let delete = to_raw_record(
            &Record::Delete {
                checkpoint: 12,
                destination_table_name: "PUBLIC.T".to_owned(),
                items,
            },
            3,
        )
        .unwrap();
        assert_eq!(delete.record_type, 2);
        assert_eq!(delete.match_data.as_deref(), Some(r#"{"id":1}"#));
    }

    #[test]
    fn raw_insert_sql_has_seven_columns_per_row() {
        let record = to_raw_record(&insert_record(), 1).unwrap();
        let sql = generate_raw_insert_sql("_PEERDB_RAW_job", &[record]);
        assert!(sql.starts_with("INSERT INTO _PEERDB_INTERNAL._PEERDB_RAW_job VALUES("));
        let row = sql.split("VALUES").nth(1).unwrap();
        // uid, timestamp, table, data, record_type, match_data, batch_id
        assert_eq!(row.matches(',').count() >= 6, true);
        assert!(row.contains(",0,NULL,1)"));
    }

    #[test]
    fn table_name_parsing() {
        assert_eq!(
            parse_table_name("PUBLIC.T").unwrap(),
            ("PUBLIC".to_owned(), "T".to_owned())
        );
        assert_eq!(
            parse_table_name("T").unwrap(),
            ("PUBLIC".to_owned(), "T".to_owned())
        );
    }
}
