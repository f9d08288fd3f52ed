use serde::{Deserialize, Serialize};

/// Generic column type shared by source and destination connectors.
/// Each connector maps these to its native types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Timestamp,
    Numeric,
    Bytes,
    Json,
    Array(Box<ColumnKind>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_identifier: String,
    /// Columns in source table order.
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key_columns: Vec<String>,
    pub is_replica_identity_full: bool,
}

impl TableSchema {
    pub fn column_kind(&self, name: &str) -> Option<&ColumnKind> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.kind)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key_columns.iter().any(|pk| pk == name)
    }
}

/// A column added on the source after the flow started. Type changes are
/// modeled as an added column with the new type; removals are not
/// propagated to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedColumn {
    pub column_name: String,
    pub column_kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchemaDelta {
    pub src_table_name: String,
    pub dst_table_name: String,
    pub added_columns: Vec<AddedColumn>,
}

impl TableSchemaDelta {
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
    }
}
