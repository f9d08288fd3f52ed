use std::collections::HashMap;

use pt::TableSchemaDelta;
use value::Value;

pub type RecordItems = HashMap<String, Value>;

/// A single row-level change decoded from the source, tagged with its
/// WAL checkpoint. Records of one batch are in source commit order.
#[derive(Debug, Clone)]
pub enum Record {
    Insert {
        checkpoint: i64,
        destination_table_name: String,
        items: RecordItems,
    },
    Update {
        checkpoint: i64,
        destination_table_name: String,
        /// Full pre-image under REPLICA IDENTITY FULL, key columns only
        /// otherwise.
        old_items: RecordItems,
        new_items: RecordItems,
    },
    Delete {
        checkpoint: i64,
        destination_table_name: String,
        items: RecordItems,
    },
}

impl Record {
    pub fn checkpoint(&self) -> i64 {
        match self {
            Record::Insert { checkpoint, .. }
            | Record::Update { checkpoint, .. }
            | Record::Delete { checkpoint, .. } => *checkpoint,
        }
    }

    pub fn destination_table_name(&self) -> &str {
        match self {
            Record::Insert {
                destination_table_name,
                ..
            }
            | Record::Update {
                destination_table_name,
                ..
            }
            | Record::Delete {
                destination_table_name,
                ..
            } => destination_table_name,
        }
    }
}

/// A batch of commit-closed records pulled from the source.
///
/// Invariant: `first_checkpoint <= r.checkpoint() <= last_checkpoint` for
/// every record in the batch.
#[derive(Debug, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub first_checkpoint: i64,
    pub last_checkpoint: i64,
    pub schema_deltas: Vec<TableSchemaDelta>,
}

impl RecordBatch {
    pub fn push(&mut self, record: Record) {
        if self.records.is_empty() {
            self.first_checkpoint = record.checkpoint();
        }
        self.last_checkpoint = self.last_checkpoint.max(record.checkpoint());
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
