//! Avro staging for QRep: container-file writing and object-store upload.

use anyhow::{anyhow, Context};
use apache_avro::types::Value as AvroValue;
use apache_avro::{Schema as AvroSchema, Writer};
use model::{QRecord, QRecordSchema};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use pt::ColumnKind;
use tracing::info;
use value::Value;

fn avro_type_for(kind: &ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool => "boolean",
        ColumnKind::Int32 => "int",
        ColumnKind::Int64 => "long",
        ColumnKind::Float32 => "float",
        ColumnKind::Float64 => "double",
        ColumnKind::Bytes => "bytes",
        // timestamps, numerics, json and arrays travel as strings and are
        // cast by COPY INTO on the destination
        _ => "string",
    }
}

pub fn avro_schema_for(schema: &QRecordSchema) -> anyhow::Result<AvroSchema> {
    let fields: Vec<serde_json::Value> = schema
        .fields
        .iter()
        .map(|field| {
            serde_json::json!({
                "name": field.name,
                "type": ["null", avro_type_for(&field.kind)],
                "default": null,
            })
        })
        .collect();
    let record = serde_json::json!({
        "type": "record",
        "name": "QRepRecord",
        "fields": fields,
    });
    AvroSchema::parse(&record).context("failed to build avro schema")
}

fn to_avro_value(kind: &ColumnKind, value: &Value) -> AvroValue {
    let inner = match value {
        Value::Null => return AvroValue::Union(0, Box::new(AvroValue::Null)),
        Value::Bool(b) => AvroValue::Boolean(*b),
        Value::Integer(n) => AvroValue::Int(*n),
        Value::BigInt(n) => AvroValue::Long(*n),
        Value::Float(n) => AvroValue::Float(*n),
        Value::Double(n) => AvroValue::Double(*n),
        Value::Numeric(n) => AvroValue::String(n.to_string()),
        Value::Text(s) => AvroValue::String(s.clone()),
        Value::Timestamp(ts) => AvroValue::String(ts.to_string()),
        Value::Binary(b) => AvroValue::Bytes(b.to_vec()),
        Value::Json(v) => AvroValue::String(v.to_string()),
        Value::Array(arr) => AvroValue::String(arr.to_serde_json_value().to_string()),
    };
    // widen to the declared field type where the decoded value is narrower
    let inner = match (kind, inner) {
        (ColumnKind::Int64, AvroValue::Int(n)) => AvroValue::Long(n as i64),
        (ColumnKind::Float64, AvroValue::Float(n)) => AvroValue::Double(f64::from(n)),
        (ColumnKind::String, AvroValue::Int(n)) => AvroValue::String(n.to_string()),
        (ColumnKind::String, AvroValue::Long(n)) => AvroValue::String(n.to_string()),
        (_, inner) => inner,
    };
    AvroValue::Union(1, Box::new(inner))
}

/// Serialize a partition into one Avro object container file in memory.
pub fn write_partition_avro(
    schema: &QRecordSchema,
    records: &[QRecord],
) -> anyhow::Result<Vec<u8>> {
    let avro_schema = avro_schema_for(schema)?;
    let mut writer = Writer::new(&avro_schema, Vec::new());
    for record in records {
        let fields: Vec<(String, AvroValue)> = schema
            .fields
            .iter()
            .zip(record.values.iter())
            .map(|(field, value)| (field.name.clone(), to_avro_value(&field.kind, value)))
            .collect();
        writer
            .append(AvroValue::Record(fields))
            .context("failed to append avro record")?;
    }
    writer.into_inner().context("failed to finish avro file")
}

/// Upload a staged file, returning the external URL COPY INTO reads from.
pub async fn upload_to_staging(
    staging_path: &str,
    object_key: &str,
    bytes: Vec<u8>,
) -> anyhow::Result<String> {
    if let Some(rest) = staging_path.strip_prefix("s3://") {
        let (bucket, prefix) = split_bucket_path(rest);
        let store = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .context("failed to build s3 store")?;
        let path = join_key(&prefix, object_key);
        store
            .put(&ObjectPath::from(path.clone()), PutPayload::from(bytes))
            .await
            .context("failed to upload avro file to s3")?;
        info!("staged avro file at s3://{}/{}", bucket, path);
        Ok(format!("s3://{}/{}", bucket, path))
    } else if let Some(rest) = staging_path
        .strip_prefix("gs://")
        .or_else(|| staging_path.strip_prefix("gcs://"))
    {
        let (bucket, prefix) = split_bucket_path(rest);
        let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .context("failed to build gcs store")?;
        let path = join_key(&prefix, object_key);
        store
            .put(&ObjectPath::from(path.clone()), PutPayload::from(bytes))
            .await
            .context("failed to upload avro file to gcs")?;
        Ok(format!("gcs://{}/{}", bucket, path))
    } else {
        Err(anyhow!(
            "snowflake avro staging requires an s3:// or gs:// staging path, got {}",
            staging_path
        ))
    }
}

fn split_bucket_path(rest: &str) -> (&str, String) {
    match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/').to_owned()),
        None => (rest, String::new()),
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{}/{}", prefix, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::Reader;
    use model::QField;

    fn schema() -> QRecordSchema {
        QRecordSchema::new(vec![
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
        ])
    }

    #[test]
    fn writes_readable_container_file() {
        let records = vec![
            QRecord::new(vec![Value::BigInt(1), Value::Text("a".to_owned())]),
            QRecord::new(vec![Value::BigInt(2), Value::Null]),
        ];
        let bytes = write_partition_avro(&schema(), &records).unwrap();

        let reader = Reader::new(&bytes[..]).unwrap();
        let decoded: Vec<AvroValue> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(decoded.len(), 2);
        match &decoded[1] {
            AvroValue::Record(fields) => {
                assert_eq!(fields[0].0, "id");
                assert_eq!(
                    fields[0].1,
                    AvroValue::Union(1, Box::new(AvroValue::Long(2)))
                );
                assert_eq!(
                    fields[1].1,
                    AvroValue::Union(0, Box::new(AvroValue::Null))
                );
            }
            other => panic!("unexpected avro value: {:?}", other),
        }
    }

    #[test]
    fn staging_path_parsing() {
        assert_eq!(
            split_bucket_path("my-bucket/some/prefix/"),
            ("my-bucket", "some/prefix".to_owned())
        );
        assert_eq!(split_bucket_path("my-bucket"), ("my-bucket", String::new()));
    }
}
