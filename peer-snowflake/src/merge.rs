//! SQL generation for normalized tables and the normalize MERGE.

use pt::{ColumnKind, TableSchema};

pub const PEERDB_INTERNAL_SCHEMA: &str = "_PEERDB_INTERNAL";
pub const MIRROR_JOBS_TABLE: &str = "PEERDB_MIRROR_JOBS";
pub const QREP_PARTITIONS_TABLE: &str = "PEERDB_QREP_PARTITIONS";
pub const RAW_TABLE_PREFIX: &str = "_PEERDB_RAW";
pub const SOFT_DELETE_COLUMN: &str = "_PEERDB_IS_DELETED";

const TO_VARIANT_COLUMN: &str = "VAR_COLS";

pub fn get_raw_table_identifier(flow_job_name: &str) -> String {
    let sanitized: String = flow_job_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", RAW_TABLE_PREFIX, sanitized)
}

/// Generic to Snowflake type mapping. Unknown kinds become STRING.
pub fn snowflake_type_for(kind: &ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool => "BOOLEAN",
        ColumnKind::Int32 | ColumnKind::Int64 => "INT",
        ColumnKind::Float32 | ColumnKind::Float64 => "FLOAT",
        ColumnKind::String => "STRING",
        ColumnKind::Timestamp => "TIMESTAMP_NTZ",
        ColumnKind::Numeric => "NUMBER(38,20)",
        ColumnKind::Bytes => "BINARY",
        ColumnKind::Json => "VARIANT",
        ColumnKind::Array(_) => "ARRAY",
    }
}

pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn generate_create_normalized_table_sql(
    table_identifier: &str,
    schema: &TableSchema,
    soft_delete: bool,
) -> String {
    let mut column_sql: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let upper = column.name.to_uppercase();
            if schema.is_primary_key(&column.name) && schema.primary_key_columns.len() == 1 {
                format!("{} {} PRIMARY KEY", upper, snowflake_type_for(&column.kind))
            } else {
                format!("{} {}", upper, snowflake_type_for(&column.kind))
            }
        })
        .collect();
    if schema.primary_key_columns.len() > 1 {
        let pk_list: Vec<String> = schema
            .primary_key_columns
            .iter()
            .map(|c| c.to_uppercase())
            .collect();
        column_sql.push(format!("PRIMARY KEY ({})", pk_list.join(",")));
    }
    if soft_delete {
        column_sql.push(format!("{} BOOLEAN DEFAULT FALSE", SOFT_DELETE_COLUMN));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {}({})",
        table_identifier,
        column_sql.join(",")
    )
}

/// The normalize MERGE: project raw rows of the batch window to VARIANT,
/// flatten with explicit casts, keep only the latest event per primary
/// key, then insert/update/delete on the target. The rank ORDER BY has a
/// stable _PEERDB_UID tiebreaker so equal timestamps dedup
/// deterministically.
pub fn generate_merge_statement(
    destination_table: &str,
    raw_table_identifier: &str,
    schema: &TableSchema,
    normalize_batch_id: i64,
    sync_batch_id: i64,
    soft_delete: bool,
) -> String {
    let column_names: Vec<String> = schema
        .columns
        .iter()
        .map(|c| c.name.to_uppercase())
        .collect();

    let flattened_casts: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            format!(
                "CAST({}:{} AS {}) AS {}",
                TO_VARIANT_COLUMN,
                column.name,
                snowflake_type_for(&column.kind),
                column.name.to_uppercase()
            )
        })
        .collect();

    let pk_list: Vec<String> = schema
        .primary_key_columns
        .iter()
        .map(|c| c.to_uppercase())
        .collect();
    let on_clause: Vec<String> = pk_list
        .iter()
        .map(|pk| format!("TARGET.{}=SOURCE.{}", pk, pk))
        .collect();

    let insert_values: Vec<String> = column_names
        .iter()
        .map(|c| format!("SOURCE.{}", c))
        .collect();
    let update_sets: Vec<String> = column_names
        .iter()
        .map(|c| format!("{}=SOURCE.{}", c, c))
        .collect();

    let delete_clause = if soft_delete {
        format!("UPDATE SET {}=TRUE", SOFT_DELETE_COLUMN)
    } else {
        "DELETE".to_owned()
    };

    format!(
        "MERGE INTO {target} TARGET USING (WITH VARIANT_CONVERTED AS \
         (SELECT _PEERDB_UID,_PEERDB_TIMESTAMP,TO_VARIANT(PARSE_JSON(_PEERDB_DATA)) {variant},\
         _PEERDB_RECORD_TYPE,_PEERDB_MATCH_DATA,_PEERDB_BATCH_ID FROM {schema}.{raw} \
         WHERE _PEERDB_BATCH_ID > {norm} AND _PEERDB_BATCH_ID <= {sync} \
         AND _PEERDB_DESTINATION_TABLE_NAME = {target_literal}), FLATTENED AS \
         (SELECT _PEERDB_UID,_PEERDB_TIMESTAMP,_PEERDB_RECORD_TYPE,_PEERDB_MATCH_DATA,\
         _PEERDB_BATCH_ID,{casts} FROM VARIANT_CONVERTED), DEDUPLICATED_FLATTENED AS \
         (SELECT RANKED.* FROM (SELECT RANK() OVER \
         (PARTITION BY {pks} ORDER BY _PEERDB_TIMESTAMP DESC,_PEERDB_UID DESC) AS _PEERDB_RANK,* \
         FROM FLATTENED) RANKED WHERE _PEERDB_RANK=1) \
         SELECT * FROM DEDUPLICATED_FLATTENED) SOURCE ON {on_clause} \
         WHEN NOT MATCHED AND (SOURCE._PEERDB_RECORD_TYPE != 2) THEN INSERT ({cols}) VALUES({vals}) \
         WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE != 2) THEN UPDATE SET {sets} \
         WHEN MATCHED AND (SOURCE._PEERDB_RECORD_TYPE = 2) THEN {delete_clause}",
        target = destination_table,
        variant = TO_VARIANT_COLUMN,
        schema = PEERDB_INTERNAL_SCHEMA,
        raw = raw_table_identifier,
        norm = normalize_batch_id,
        sync = sync_batch_id,
        target_literal = quote_literal(destination_table),
        casts = flattened_casts.join(","),
        pks = pk_list.join(","),
        on_clause = on_clause.join(" AND "),
        cols = column_names.join(","),
        vals = insert_values.join(","),
        sets = update_sets.join(","),
        delete_clause = delete_clause,
    )
}

pub fn generate_distinct_table_names_sql(
    raw_table_identifier: &str,
    normalize_batch_id: i64,
    sync_batch_id: i64,
) -> String {
    format!(
        "SELECT DISTINCT _PEERDB_DESTINATION_TABLE_NAME FROM {}.{} \
         WHERE _PEERDB_BATCH_ID > {} AND _PEERDB_BATCH_ID <= {}",
        PEERDB_INTERNAL_SCHEMA, raw_table_identifier, normalize_batch_id, sync_batch_id
    )
}
