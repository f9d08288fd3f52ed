//! QRep partition discovery and extraction on the source side.

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{pin_mut, TryStreamExt};
use model::{QField, QRecord, QRecordSchema, QRecordStreamSender};
use pt::{PartitionRange, QRepConfig, QRepPartition, TupleId};
use tokio_postgres::Client;
use tracing::info;
use uuid::Uuid;

use crate::types::{column_kind_from_pg_type, value_from_row};

const DEFAULT_NUM_ROWS_PER_PARTITION: u32 = 500_000;

/// Discover the partitions covering `(last_end, current_max]` on the
/// watermark column, bucketed by equal row count. Returns partitions in
/// increasing range order.
pub async fn get_qrep_partitions(
    client: &Client,
    config: &QRepConfig,
    last: Option<&QRepPartition>,
    run_uuid: &str,
) -> anyhow::Result<Vec<QRepPartition>> {
    if config.watermark_column.is_empty() {
        // no watermark: the whole table is one partition
        return Ok(vec![QRepPartition {
            partition_id: Uuid::new_v4().to_string(),
            range: PartitionRange::FullTable,
            run_uuid: run_uuid.to_owned(),
        }]);
    }

    if config.watermark_column.eq_ignore_ascii_case("ctid") {
        return get_tid_partitions(client, config, last, run_uuid).await;
    }

    let num_rows_per_partition = if config.num_rows_per_partition > 0 {
        config.num_rows_per_partition
    } else {
        DEFAULT_NUM_ROWS_PER_PARTITION
    };

    let where_clause = last
        .map(|p| {
            format!(
                "WHERE {} > {}",
                config.watermark_column,
                range_end_literal(&p.range)
            )
        })
        .unwrap_or_default();

    let count_query = format!(
        "SELECT COUNT(*) FROM {} {}",
        config.watermark_table, where_clause
    );
    let count: i64 = client
        .query_one(&count_query, &[])
        .await
        .context("failed to count rows for partitioning")?
        .get(0);
    if count == 0 {
        info!("no new rows in {}, no partitions", config.watermark_table);
        return Ok(vec![]);
    }

    let num_partitions = (count as u64).div_ceil(num_rows_per_partition as u64) as i32;
    info!(
        "partitioning {} rows of {} into {} bucket(s)",
        count, config.watermark_table, num_partitions
    );

    let bucket_query = format!(
        "SELECT bucket, MIN({wm}) AS start, MAX({wm}) AS \"end\" FROM \
         (SELECT NTILE($1) OVER (ORDER BY {wm}) AS bucket, {wm} FROM {tbl} {where_clause}) subquery \
         GROUP BY bucket ORDER BY start",
        wm = config.watermark_column,
        tbl = config.watermark_table,
        where_clause = where_clause,
    );
    let rows = client
        .query(&bucket_query, &[&num_partitions])
        .await
        .context("failed to compute partition buckets")?;

    let mut partitions = Vec::with_capacity(rows.len());
    for row in &rows {
        let range = match row.columns()[1].type_() {
            t if t == &tokio_postgres::types::Type::TIMESTAMP => PartitionRange::Timestamp {
                start: DateTime::from_naive_utc_and_offset(row.get::<_, NaiveDateTime>(1), Utc),
                end: DateTime::from_naive_utc_and_offset(row.get::<_, NaiveDateTime>(2), Utc),
            },
            t if t == &tokio_postgres::types::Type::TIMESTAMPTZ => PartitionRange::Timestamp {
                start: row.get::<_, DateTime<Utc>>(1),
                end: row.get::<_, DateTime<Utc>>(2),
            },
            t if t == &tokio_postgres::types::Type::INT2 => PartitionRange::Int {
                start: row.get::<_, i16>(1) as i64,
                end: row.get::<_, i16>(2) as i64,
            },
            t if t == &tokio_postgres::types::Type::INT4 => PartitionRange::Int {
                start: row.get::<_, i32>(1) as i64,
                end: row.get::<_, i32>(2) as i64,
            },
            _ => PartitionRange::Int {
                start: row.get::<_, i64>(1),
                end: row.get::<_, i64>(2),
            },
        };
        partitions.push(QRepPartition {
            partition_id: Uuid::new_v4().to_string(),
            range,
            run_uuid: run_uuid.to_owned(),
        });
    }
    Ok(partitions)
}

/// Partition a table without a usable watermark column by physical block
/// ranges over ctid.
async fn get_tid_partitions(
    client: &Client,
    config: &QRepConfig,
    last: Option<&QRepPartition>,
    run_uuid: &str,
) -> anyhow::Result<Vec<QRepPartition>> {
    let row = client
        .query_one(
            "SELECT (pg_relation_size($1::regclass) / current_setting('block_size')::bigint)::bigint, \
             GREATEST(reltuples::bigint, 0) FROM pg_class WHERE oid = $1::regclass",
            &[&config.watermark_table],
        )
        .await
        .context("failed to read relation size for tid partitioning")?;
    let num_blocks: i64 = row.get(0);
    let est_rows: i64 = row.get(1);

    let start_block = match last {
        Some(QRepPartition {
            range: PartitionRange::Tid { end, .. },
            ..
        }) => end.block_number.saturating_add(1) as i64,
        _ => 0,
    };
    if num_blocks <= start_block {
        return Ok(vec![]);
    }

    let num_rows_per_partition = if config.num_rows_per_partition > 0 {
        config.num_rows_per_partition as i64
    } else {
        DEFAULT_NUM_ROWS_PER_PARTITION as i64
    };
    let num_partitions = ((est_rows.max(1) as u64).div_ceil(num_rows_per_partition as u64) as i64)
        .max(1);
    let blocks_per_partition =
        ((num_blocks - start_block) as u64).div_ceil(num_partitions as u64) as i64;

    let mut partitions = Vec::new();
    let mut block = start_block;
    while block < num_blocks {
        let end_block = (block + blocks_per_partition - 1).min(num_blocks - 1);
        partitions.push(QRepPartition {
            partition_id: Uuid::new_v4().to_string(),
            range: PartitionRange::Tid {
                start: TupleId {
                    block_number: block as u32,
                    offset_number: 0,
                },
                end: TupleId {
                    block_number: end_block as u32,
                    offset_number: u16::MAX,
                },
            },
            run_uuid: run_uuid.to_owned(),
        });
        block = end_block + 1;
    }
    Ok(partitions)
}

/// Execute the partition query and stream rows in arrival order. The
/// schema is announced from the prepared statement before the first row,
/// so empty partitions still carry a schema. On failure the stream is
/// closed with the error.
pub async fn pull_qrep_records(
    client: &Client,
    config: &QRepConfig,
    partition: &QRepPartition,
    mut sender: QRecordStreamSender,
) -> anyhow::Result<u64> {
    let query = substitute_partition_bounds(&config.query, &partition.range);
    info!(
        "pulling partition {} with query: {}",
        partition.partition_id, query
    );

    match pull_inner(client, &query, &mut sender).await {
        Ok(rows) => Ok(rows),
        Err(err) => {
            let msg = format!("{:#}", err);
            sender.close_with_error(err).await;
            Err(anyhow::anyhow!(msg))
        }
    }
}

async fn pull_inner(
    client: &Client,
    query: &str,
    sender: &mut QRecordStreamSender,
) -> anyhow::Result<u64> {
    let statement = client.prepare(query).await.context("failed to prepare partition query")?;

    let fields = statement
        .columns()
        .iter()
        .map(|c| QField {
            name: c.name().to_owned(),
            kind: column_kind_from_pg_type(c.type_()),
            nullable: true,
        })
        .collect();
    sender.set_schema(QRecordSchema::new(fields))?;

    let columns: Vec<tokio_postgres::types::Type> =
        statement.columns().iter().map(|c| c.type_().clone()).collect();

    let stream = client
        .query_raw(&statement, std::iter::empty::<&str>())
        .await
        .context("failed to execute partition query")?;
    pin_mut!(stream);

    let mut num_rows: u64 = 0;
    while let Some(row) = stream.try_next().await? {
        let mut values = Vec::with_capacity(columns.len());
        for (idx, pg_type) in columns.iter().enumerate() {
            values.push(value_from_row(&row, idx, pg_type)?);
        }
        sender.send(QRecord::new(values)).await?;
        num_rows += 1;
    }
    Ok(num_rows)
}

/// True when rows past the last partition's end exist.
pub async fn check_for_updated_max_value(
    client: &Client,
    config: &QRepConfig,
    last: Option<&QRepPartition>,
) -> anyhow::Result<bool> {
    let Some(last) = last else {
        return Ok(true);
    };
    let query = format!(
        "SELECT COUNT(*) FROM {} WHERE {} > {}",
        config.watermark_table,
        config.watermark_column,
        range_end_literal(&last.range)
    );
    let count: i64 = client
        .query_one(&query, &[])
        .await
        .context("failed to check for new rows")?
        .get(0);
    Ok(count > 0)
}

fn substitute_partition_bounds(query: &str, range: &PartitionRange) -> String {
    match range {
        PartitionRange::FullTable => query.to_owned(),
        _ => query
            .replace("{{.start}}", &range_start_literal(range))
            .replace("{{.end}}", &range_end_literal(range)),
    }
}

fn range_start_literal(range: &PartitionRange) -> String {
    match range {
        PartitionRange::Int { start, .. } => start.to_string(),
        PartitionRange::Timestamp { start, .. } => {
            format!("'{}'", start.format("%Y-%m-%d %H:%M:%S%.6f+00"))
        }
        PartitionRange::Tid { start, .. } => {
            format!("'({},{})'", start.block_number, start.offset_number)
        }
        PartitionRange::FullTable => String::new(),
    }
}

fn range_end_literal(range: &PartitionRange) -> String {
    match range {
        PartitionRange::Int { end, .. } => end.to_string(),
        PartitionRange::Timestamp { end, .. } => {
            format!("'{}'", end.format("%Y-%m-%d %H:%M:%S%.6f+00"))
        }
        PartitionRange::Tid { end, .. } => {
            format!("'({},{})'", end.block_number, end.offset_number)
        }
        PartitionRange::FullTable => String::new(),
    }
}
