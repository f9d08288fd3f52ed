//! CDC pull loop: streams pgoutput messages from a replication slot and
//! assembles commit-closed record batches.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, Bytes};
use model::{FlowError, PullRecordsRequest, PullRecordsResult, Record, RecordBatch, RecordItems};
use postgres_connection::replication::ReplicationStream;
use pt::{
    AddedColumn, ColumnKind, RelationColumn, RelationMessage, RelationMessageMapping,
    TableSchemaDelta,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pgoutput::{self, PgOutputMessage, RelationBody, Tuple, TupleData};
use crate::types::{column_kind_from_oid, parse_text_value};

const STANDBY_STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct CdcPull {
    stream: ReplicationStream,
    relations: RelationMessageMapping,
    src_table_id_name_mapping: HashMap<u32, String>,
    table_name_mapping: HashMap<String, String>,
    baseline_columns: HashMap<String, Vec<(String, ColumnKind)>>,
    /// Offset durably committed on the destination; WAL below this can be
    /// released.
    confirmed_flush_lsn: i64,
    max_batch_size: u32,
    idle_timeout: Duration,
}

impl CdcPull {
    pub fn new(stream: ReplicationStream, req: &PullRecordsRequest) -> Self {
        let baseline_columns = req
            .table_name_schema_mapping
            .iter()
            .map(|(dst, schema)| {
                (
                    dst.clone(),
                    schema
                        .columns
                        .iter()
                        .map(|c| (c.name.clone(), c.kind.clone()))
                        .collect(),
                )
            })
            .collect();
        Self {
            stream,
            relations: req.relation_message_mapping.clone(),
            src_table_id_name_mapping: req.src_table_id_name_mapping.clone(),
            table_name_mapping: req.table_name_mapping.clone(),
            baseline_columns,
            confirmed_flush_lsn: req.last_sync_state.map(|s| s.checkpoint).unwrap_or(0),
            max_batch_size: req.max_batch_size,
            idle_timeout: req.idle_timeout,
        }
    }

    /// Pull one batch. The batch closes when `max_batch_size` commit-closed
    /// records accumulated, when the idle timeout elapses, or on
    /// cancellation. An idle stream yields an empty batch so the caller can
    /// decide to heartbeat the slot. Records of an uncommitted transaction
    /// never cross the batch boundary.
    pub async fn pull(mut self, cancel: &CancellationToken) -> anyhow::Result<PullRecordsResult> {
        let mut batch = RecordBatch::default();
        let mut schema_deltas: Vec<TableSchemaDelta> = Vec::new();
        let mut in_tx: Vec<Record> = Vec::new();

        let mut idle_deadline = Instant::now() + self.idle_timeout;
        let mut next_status_update = Instant::now() + STANDBY_STATUS_INTERVAL;

        loop {
            if cancel.is_cancelled() {
                info!("cdc pull cancelled, closing batch with {} records", batch.len());
                break;
            }

            let now = Instant::now();
            if now >= next_status_update {
                if self.confirmed_flush_lsn > 0 {
                    self.stream
                        .send_standby_status_update(self.confirmed_flush_lsn)
                        .await?;
                }
                next_status_update = now + STANDBY_STATUS_INTERVAL;
            }
            if now >= idle_deadline {
                if in_tx.is_empty() {
                    break;
                }
                // mid-transaction, keep reading until the commit
                idle_deadline = now + self.idle_timeout;
            }

            let wait = next_status_update.min(idle_deadline);
            let msg = tokio::select! {
                _ = cancel.cancelled() => continue,
                msg = tokio::time::timeout_at(wait, self.stream.next_message()) => msg,
            };
            let Ok(msg) = msg else {
                // deadline passed without traffic, loop to handle it
                continue;
            };

            match msg? {
                Some(data) => {
                    let closed = self
                        .handle_copy_data(data, &mut batch, &mut schema_deltas, &mut in_tx)
                        .await?;
                    if closed {
                        break;
                    }
                    if !in_tx.is_empty() || !batch.is_empty() {
                        idle_deadline = Instant::now() + self.idle_timeout;
                    }
                }
                None => {
                    info!("replication stream ended");
                    if !in_tx.is_empty() {
                        warn!(
                            "stream ended with {} uncommitted records, dropping them",
                            in_tx.len()
                        );
                    }
                    break;
                }
            }
        }

        batch.schema_deltas = schema_deltas;
        Ok(PullRecordsResult {
            record_batch: batch,
            relation_message_mapping: self.relations,
        })
    }

    /// Returns true when the batch is complete.
    async fn handle_copy_data(
        &mut self,
        mut data: Bytes,
        batch: &mut RecordBatch,
        schema_deltas: &mut Vec<TableSchemaDelta>,
        in_tx: &mut Vec<Record>,
    ) -> anyhow::Result<bool> {
        if !data.has_remaining() {
            return Ok(false);
        }
        match data.get_u8() {
            b'w' => {
                let wal_start = data.get_u64() as i64;
                let wal_end = data.get_u64() as i64;
                let _server_time = data.get_i64();
                let checkpoint = if wal_start != 0 { wal_start } else { wal_end };

                // an undecodable WAL message is fatal to the batch; the
                // offset must not advance past it
                let message = pgoutput::decode(&mut data)
                    .map_err(|e| FlowError::DataCorruption(format!("undecodable WAL message: {}", e)))?;
                match message {
                    PgOutputMessage::Begin(_) => in_tx.clear(),
                    PgOutputMessage::Commit(_) => {
                        for record in in_tx.drain(..) {
                            batch.push(record);
                        }
                        if batch.len() >= self.max_batch_size as usize {
                            return Ok(true);
                        }
                    }
                    PgOutputMessage::Relation(rel) => {
                        self.handle_relation(rel, schema_deltas);
                    }
                    PgOutputMessage::Insert(ins) => {
                        if let Some((dst, rel)) = self.mapped_relation(ins.relation_id) {
                            let items = tuple_to_items(&ins.tuple, rel);
                            in_tx.push(Record::Insert {
                                checkpoint,
                                destination_table_name: dst,
                                items,
                            });
                        }
                    }
                    PgOutputMessage::Update(upd) => {
                        if let Some((dst, rel)) = self.mapped_relation(upd.relation_id) {
                            let new_items = tuple_to_items(&upd.new_tuple, rel);
                            let old_items = upd
                                .old_tuple
                                .as_ref()
                                .map(|t| tuple_to_items(t, rel))
                                .unwrap_or_default();
                            in_tx.push(Record::Update {
                                checkpoint,
                                destination_table_name: dst,
                                old_items,
                                new_items,
                            });
                        }
                    }
                    PgOutputMessage::Delete(del) => {
                        if let Some((dst, rel)) = self.mapped_relation(del.relation_id) {
                            let items = tuple_to_items(&del.old_tuple, rel);
                            in_tx.push(Record::Delete {
                                checkpoint,
                                destination_table_name: dst,
                                items,
                            });
                        }
                    }
                    PgOutputMessage::Origin | PgOutputMessage::Type | PgOutputMessage::Truncate => {}
                }
            }
            b'k' => {
                let _wal_end = data.get_u64();
                let _server_time = data.get_i64();
                let reply_requested = data.get_u8();
                if reply_requested == 1 && self.confirmed_flush_lsn > 0 {
                    self.stream
                        .send_standby_status_update(self.confirmed_flush_lsn)
                        .await?;
                }
            }
            other => {
                warn!("unknown replication stream message: {}", other as char);
            }
        }
        Ok(false)
    }

    fn mapped_relation(&self, relation_id: u32) -> Option<(String, &RelationMessage)> {
        let rel = self.relations.get(&relation_id)?;
        let src_name = self.src_table_id_name_mapping.get(&relation_id)?;
        let dst = self.table_name_mapping.get(src_name)?;
        Some((dst.clone(), rel))
    }

    /// Record schema deltas against the previous relation message (or the
    /// configured baseline on the first one), then refresh the cache.
    /// Deltas never block streaming.
    fn handle_relation(&mut self, rel: RelationBody, schema_deltas: &mut Vec<TableSchemaDelta>) {
        let src_name = rel.qualified_name();
        let message = relation_to_message(&rel);

        if let Some(dst) = self.table_name_mapping.get(&src_name).cloned() {
            let baseline: Vec<(String, ColumnKind)> = match self.relations.get(&rel.relation_id) {
                Some(prev) => prev
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.kind.clone()))
                    .collect(),
                None => self.baseline_columns.get(&dst).cloned().unwrap_or_default(),
            };

            let added_columns = compute_added_columns(&baseline, &message.columns);

            if !added_columns.is_empty() && !baseline.is_empty() {
                info!(
                    "schema delta on {}: {} column(s) added or retyped",
                    src_name,
                    added_columns.len()
                );
                schema_deltas.push(TableSchemaDelta {
                    src_table_name: src_name,
                    dst_table_name: dst,
                    added_columns,
                });
            }
        }

        self.relations.insert(rel.relation_id, message);
    }
}

/// Columns present (or retyped) in the new relation message but not in
/// the baseline.
fn compute_added_columns(
    baseline: &[(String, ColumnKind)],
    columns: &[RelationColumn],
) -> Vec<AddedColumn> {
    let mut added = Vec::new();
    for column in columns {
        match baseline.iter().find(|(name, _)| *name == column.name) {
            None => added.push(AddedColumn {
                column_name: column.name.clone(),
                column_kind: column.kind.clone(),
            }),
            Some((_, kind)) if *kind != column.kind => added.push(AddedColumn {
                column_name: column.name.clone(),
                column_kind: column.kind.clone(),
            }),
            Some(_) => {}
        }
    }
    added
}

fn relation_to_message(rel: &RelationBody) -> RelationMessage {
    RelationMessage {
        relation_id: rel.relation_id,
        relation_name: rel.qualified_name(),
        columns: rel
            .columns
            .iter()
            .map(|c| RelationColumn {
                name: c.name.clone(),
                kind: column_kind_from_oid(c.type_oid),
                type_oid: c.type_oid,
            })
            .collect(),
    }
}

/// Decode a wire tuple into typed items. Unchanged TOAST columns are
/// omitted so normalization keeps the destination value.
fn tuple_to_items(tuple: &Tuple, rel: &RelationMessage) -> RecordItems {
    let mut items = RecordItems::with_capacity(tuple.0.len());
    for (data, column) in tuple.0.iter().zip(rel.columns.iter()) {
        match data {
            TupleData::Null => {
                items.insert(column.name.clone(), value::Value::Null);
            }
            TupleData::Toast => {}
            TupleData::Text(text) => {
                let text = String::from_utf8_lossy(text);
                items.insert(column.name.clone(), parse_text_value(&column.kind, &text));
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgoutput::RelationColumnBody;

    fn relation_body(columns: Vec<(&str, u32)>) -> RelationBody {
        RelationBody {
            relation_id: 1,
            namespace: "public".to_owned(),
            name: "t".to_owned(),
            replica_identity: b'd',
            columns: columns
                .into_iter()
                .map(|(name, oid)| RelationColumnBody {
                    flags: 0,
                    name: name.to_owned(),
                    type_oid: oid,
                    type_modifier: -1,
                })
                .collect(),
        }
    }

    #[test]
    fn detects_added_and_retyped_columns() {
        let baseline = vec![
            ("id".to_owned(), ColumnKind::Int32),
            ("v".to_owned(), ColumnKind::String),
        ];
        let rel = relation_to_message(&relation_body(vec![
            ("id", 23),
            ("v", 25),
            ("c", 23),
        ]));
        let added = compute_added_columns(&baseline, &rel.columns);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].column_name, "c");
        assert_eq!(added[0].column_kind, ColumnKind::Int32);

        // widening id to bigint reports the column again with its new kind
        let rel = relation_to_message(&relation_body(vec![("id", 20), ("v", 25)]));
        let added = compute_added_columns(&baseline, &rel.columns);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].column_name, "id");
        assert_eq!(added[0].column_kind, ColumnKind::Int64);
    }

    #[test]
    fn tuple_decoding_skips_toast() {
        let rel = relation_to_message(&relation_body(vec![("id", 23), ("v", 25), ("blob", 17)]));
        let tuple = Tuple(vec![
            TupleData::Text(Bytes::from_static(b"7")),
            TupleData::Null,
            TupleData::Toast,
        ]);
        let items = tuple_to_items(&tuple, &rel);
        assert_eq!(items.get("id"), Some(&value::Value::Integer(7)));
        assert_eq!(items.get("v"), Some(&value::Value::Null));
        assert!(!items.contains_key("blob"));
    }
}
