//! QRep sync on the destination: multi-row inserts or Avro staging with
//! COPY INTO, plus per-partition sentinels so restarts skip finished work.

use anyhow::Context;
use model::{FlowError, QRecord, QRecordSchema, QRecordStreamReceiver};
use pt::{QRepConfig, QRepPartition, QRepSyncMode, QRepWriteType};
use tracing::info;
use value::Value;

use crate::merge::{quote_literal, PEERDB_INTERNAL_SCHEMA, QREP_PARTITIONS_TABLE};
use crate::{avro, SnowflakeConnector};

const DEFAULT_INSERT_BATCH_SIZE: usize = 1000;

impl SnowflakeConnector {
    pub async fn setup_qrep_metadata_tables(&self, config: &QRepConfig) -> anyhow::Result<()> {
        self.setup_metadata_tables().await?;
        info!(
            "qrep metadata ready for job {} targeting {}",
            config.flow_job_name, config.destination_table_identifier
        );
        Ok(())
    }

    /// A partition with a sentinel row has already been fully synced; a
    /// restarted run must skip it.
    pub async fn is_qrep_partition_synced(
        &self,
        flow_job_name: &str,
        partition_id: &str,
    ) -> anyhow::Result<bool> {
        self.client()
            .query_scalar_bool(&format!(
                "SELECT TO_BOOLEAN(COUNT(1)) FROM {}.{} \
                 WHERE FLOW_JOB_NAME={} AND PARTITION_UUID={}",
                PEERDB_INTERNAL_SCHEMA,
                QREP_PARTITIONS_TABLE,
                quote_literal(flow_job_name),
                quote_literal(partition_id)
            ))
            .await
    }

    /// Drain the stream into the destination table. Writes and the
    /// partition sentinel commit atomically, making per-partition retries
    /// idempotent.
    #[tracing::instrument(name = "peer_sflake::sync_qrep_records", skip_all, fields(partition = %partition.partition_id))]
    pub async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        mut stream: QRecordStreamReceiver,
    ) -> anyhow::Result<u64> {
        if config.write_mode.write_type == QRepWriteType::Upsert {
            return Err(FlowError::FailedPrecondition(
                "snowflake qrep only supports append write mode, got upsert".to_owned(),
            )
            .into());
        }

        let schema = stream.schema().await?;
        let mut records = Vec::new();
        while let Some(record) = stream.recv().await {
            records.push(record?);
        }
        if records.is_empty() {
            info!("no records to push for partition {}", partition.partition_id);
            return Ok(0);
        }
        let num_records = records.len() as u64;

        let mut statements = match config.sync_mode {
            QRepSyncMode::MultiInsert => {
                multi_insert_statements(config, &schema, &records)
            }
            QRepSyncMode::StorageAvro => {
                let bytes = avro::write_partition_avro(&schema, &records)?;
                let object_key = format!(
                    "{}/{}/{}.avro",
                    config.flow_job_name, partition.run_uuid, partition.partition_id
                );
                let staged_url =
                    avro::upload_to_staging(&config.staging_path, &object_key, bytes).await?;
                vec![copy_into_statement(config, &staged_url)]
            }
        };
        statements.push(format!(
            "INSERT INTO {}.{} VALUES ({},{},{},{},CURRENT_TIMESTAMP)",
            PEERDB_INTERNAL_SCHEMA,
            QREP_PARTITIONS_TABLE,
            quote_literal(&config.flow_job_name),
            quote_literal(&partition.partition_id),
            quote_literal(&partition.run_uuid),
            num_records
        ));

        self.client()
            .execute_transaction(&statements)
            .await
            .context("failed to sync qrep partition")?;
        info!(
            "pushed {} records for partition {}",
            num_records, partition.partition_id
        );
        Ok(num_records)
    }

    /// The Avro path lands rows in the destination table directly via
    /// COPY INTO, so consolidation has nothing left to move.
    pub async fn consolidate_qrep_partitions(&self, config: &QRepConfig) -> anyhow::Result<()> {
        info!(
            "consolidation complete for job {} into {}",
            config.flow_job_name, config.destination_table_identifier
        );
        Ok(())
    }

    pub async fn qrep_flow_cleanup(&self, flow_job_name: &str) -> anyhow::Result<()> {
        self.client()
            .execute(&format!(
                "DELETE FROM {}.{} WHERE FLOW_JOB_NAME={}",
                PEERDB_INTERNAL_SCHEMA,
                QREP_PARTITIONS_TABLE,
                quote_literal(flow_job_name)
            ))
            .await
            .context("failed to clean up qrep metadata")?;
        Ok(())
    }
}

fn multi_insert_statements(
    config: &QRepConfig,
    schema: &QRecordSchema,
    records: &[QRecord],
) -> Vec<String> {
    let batch_size = if config.batch_size_int > 0 {
        config.batch_size_int as usize
    } else {
        DEFAULT_INSERT_BATCH_SIZE
    };
    let column_list = schema
        .fields
        .iter()
        .map(|f| f.name.to_uppercase())
        .collect::<Vec<_>>()
        .join(",");

    records
        .chunks(batch_size)
        .map(|chunk| {
            let rows: Vec<String> = chunk
                .iter()
                .map(|record| {
                    let values: Vec<String> =
                        record.values.iter().map(value_to_sql_literal).collect();
                    format!("({})", values.join(","))
                })
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES{}",
                config.destination_table_identifier,
                column_list,
                rows.join(",")
            )
        })
        .collect()
}

fn copy_into_statement(config: &QRepConfig, staged_url: &str) -> String {
    let mut statement = format!(
        "COPY INTO {} FROM '{}'",
        config.destination_table_identifier, staged_url
    );
    let integration = &config.destination_peer;
    if let Some(sf) = integration.snowflake_config() {
        if !sf.s3_integration.is_empty() {
            statement.push_str(&format!(" STORAGE_INTEGRATION = {}", sf.s3_integration));
        }
    }
    statement.push_str(" FILE_FORMAT = (TYPE = AVRO) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE");
    statement
}

fn value_to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_owned(),
        Value::Integer(n) => n.to_string(),
        Value::BigInt(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::Numeric(n) => n.to_string(),
        Value::Text(s) => quote_literal(s),
        Value::Timestamp(ts) => format!("'{}'", ts),
        Value::Binary(b) => format!(
            "TO_BINARY('{}','HEX')",
            b.iter().map(|byte| format!("{:02X}", byte)).collect::<String>()
        ),
        Value::Json(v) => format!("PARSE_JSON({})", quote_literal(&v.to_string())),
        Value::Array(arr) => format!(
            "PARSE_JSON({})",
            quote_literal(&arr.to_serde_json_value().to_string())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::QField;
    use pt::{ColumnKind, DbType, Peer, PeerConfig, QRepWriteMode, SnowflakeConfig};

    fn snowflake_peer() -> Peer {
        Peer {
            name: "sf".to_owned(),
            r#type: DbType::Snowflake,
            config: PeerConfig::Snowflake(SnowflakeConfig {
                account_id: "acct".to_owned(),
                username: "user".to_owned(),
                private_key: String::new(),
                password: None,
                database: "DB".to_owned(),
                warehouse: "WH".to_owned(),
                role: "R".to_owned(),
                query_timeout: 30,
                s3_integration: "peerdb_s3".to_owned(),
            }),
        }
    }

    fn config(sync_mode: QRepSyncMode) -> QRepConfig {
        QRepConfig {
            flow_job_name: "job".to_owned(),
            source_peer: snowflake_peer(),
            destination_peer: snowflake_peer(),
            destination_table_identifier: "PUBLIC.N".to_owned(),
            query: String::new(),
            watermark_table: String::new(),
            watermark_column: String::new(),
            initial_copy_only: true,
            sync_mode,
            batch_size_int: 2,
            max_parallel_workers: 1,
            wait_between_batches_seconds: 0,
            write_mode: QRepWriteMode {
                write_type: QRepWriteType::Append,
                upsert_key_columns: vec![],
            },
            staging_path: "s3://bucket/stage".to_owned(),
            num_rows_per_partition: 0,
        }
    }

    #[test]
    fn multi_insert_batches_rows() {
        let schema = QRecordSchema::new(vec![
            QField {
                name: "id".to_owned(),
                kind: ColumnKind::Int64,
                nullable: false,
            },
            QField {
                name: "v".to_owned(),
                kind: ColumnKind::String,
                nullable: true,
            },
        ]);
        let records = vec![
            QRecord::new(vec![Value::BigInt(1), Value::Text("a".to_owned())]),
            QRecord::new(vec![Value::BigInt(2), Value::Null]),
            QRecord::new(vec![Value::BigInt(3), Value::Text("it's".to_owned())]),
        ];
        let statements = multi_insert_statements(&config(QRepSyncMode::MultiInsert), &schema, &records);
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0],
            "INSERT INTO PUBLIC.N (ID,V) VALUES(1,'a'),(2,NULL)"
        );
        assert_eq!(statements[1], "INSERT INTO PUBLIC.N (ID,V) VALUES(3,'it''s')");
    }

    #[test]
    fn copy_into_uses_storage_integration() {
        let statement = copy_into_statement(
            &config(QRepSyncMode::StorageAvro),
            "s3://bucket/stage/job/run/p.avro",
        );
        assert_eq!(
            statement,
            "COPY INTO PUBLIC.N FROM 's3://bucket/stage/job/run/p.avro' \
             STORAGE_INTEGRATION = peerdb_s3 \
             FILE_FORMAT = (TYPE = AVRO) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE"
        );
    }
}
