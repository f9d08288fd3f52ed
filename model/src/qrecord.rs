use pt::ColumnKind;
use value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QField {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

/// Column layout of a QRep record stream, announced once before the first
/// record; all records of the stream conform to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QRecordSchema {
    pub fields: Vec<QField>,
}

impl QRecordSchema {
    pub fn new(fields: Vec<QField>) -> Self {
        Self { fields }
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// One row of a QRep partition, values in schema field order.
#[derive(Debug, Clone, PartialEq)]
pub struct QRecord {
    pub values: Vec<Value>,
}

impl QRecord {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}
