use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::qrecord::{QRecord, QRecordSchema};

/// Create a bounded single-producer single-consumer record stream.
///
/// The schema travels on a dedicated one-slot channel and must be set
/// exactly once, before or while records flow. Errors are delivered
/// in-band and close the stream; the consumer sees the first error and
/// nothing after it.
pub fn qrecord_stream(buffer: usize) -> (QRecordStreamSender, QRecordStreamReceiver) {
    let (schema_tx, schema_rx) = mpsc::channel(1);
    let (records_tx, records_rx) = mpsc::channel(buffer);
    (
        QRecordStreamSender {
            schema_tx: Some(schema_tx),
            records_tx,
        },
        QRecordStreamReceiver {
            schema_rx,
            schema_cache: None,
            records_rx,
        },
    )
}

pub struct QRecordStreamSender {
    schema_tx: Option<mpsc::Sender<QRecordSchema>>,
    records_tx: mpsc::Sender<anyhow::Result<QRecord>>,
}

impl QRecordStreamSender {
    pub fn is_schema_set(&self) -> bool {
        self.schema_tx.is_none()
    }

    pub fn set_schema(&mut self, schema: QRecordSchema) -> anyhow::Result<()> {
        let tx = self
            .schema_tx
            .take()
            .ok_or_else(|| anyhow!("schema already set"))?;
        // the slot has capacity 1 and is written at most once
        tx.try_send(schema)
            .map_err(|_| anyhow!("schema receiver dropped"))
    }

    /// Blocks while the channel is full; destination write latency
    /// throttles the producer.
    pub async fn send(&self, record: QRecord) -> anyhow::Result<()> {
        self.records_tx
            .send(Ok(record))
            .await
            .map_err(|_| anyhow!("record stream receiver dropped"))
    }

    /// Close the stream with an error. Consumes the sender so nothing can
    /// follow the error.
    pub async fn close_with_error(self, err: anyhow::Error) {
        let _ = self.records_tx.send(Err(err)).await;
    }
}

pub struct QRecordStreamReceiver {
    schema_rx: mpsc::Receiver<QRecordSchema>,
    schema_cache: Option<QRecordSchema>,
    records_rx: mpsc::Receiver<anyhow::Result<QRecord>>,
}

impl QRecordStreamReceiver {
    pub async fn schema(&mut self) -> anyhow::Result<QRecordSchema> {
        if let Some(schema) = &self.schema_cache {
            return Ok(schema.clone());
        }
        let schema = self
            .schema_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("record stream closed before schema was set"))?;
        self.schema_cache = Some(schema.clone());
        Ok(schema)
    }

    /// `None` means the producer finished cleanly.
    pub async fn recv(&mut self) -> Option<anyhow::Result<QRecord>> {
        self.records_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt::ColumnKind;
    use value::Value;

    use crate::qrecord::QField;

    fn schema() -> QRecordSchema {
        QRecordSchema::new(vec![QField {
            name: "id".to_owned(),
            kind: ColumnKind::Int64,
            nullable: false,
        }])
    }

    #[tokio::test]
    async fn schema_can_only_be_set_once() {
        let (mut tx, mut rx) = qrecord_stream(4);
        tx.set_schema(schema()).unwrap();
        assert!(tx.is_schema_set());
        assert!(tx.set_schema(schema()).is_err());
        assert_eq!(rx.schema().await.unwrap(), schema());
        // cached after first read
        assert_eq!(rx.schema().await.unwrap(), schema());
    }

    #[tokio::test]
    async fn records_arrive_in_order_and_stream_closes() {
        let (mut tx, mut rx) = qrecord_stream(4);
        tx.set_schema(schema()).unwrap();
        tokio::spawn(async move {
            for i in 0..3 {
                tx.send(QRecord::new(vec![Value::BigInt(i)])).await.unwrap();
            }
        });
        let mut seen = Vec::new();
        while let Some(record) = rx.recv().await {
            seen.push(record.unwrap().values[0].clone());
        }
        assert_eq!(
            seen,
            vec![Value::BigInt(0), Value::BigInt(1), Value::BigInt(2)]
        );
    }

    #[tokio::test]
    async fn error_closes_the_stream() {
        let (mut tx, mut rx) = qrecord_stream(4);
        tx.set_schema(schema()).unwrap();
        tx.send(QRecord::new(vec![Value::BigInt(1)])).await.unwrap();
        tx.close_with_error(anyhow!("boom")).await;

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn bounded_channel_applies_backpressure() {
        let (mut tx, mut rx) = qrecord_stream(1);
        tx.set_schema(schema()).unwrap();
        tx.send(QRecord::new(vec![Value::BigInt(1)])).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tx.send(QRecord::new(vec![Value::BigInt(2)])),
        )
        .await;
        assert!(blocked.is_err(), "send should block on a full channel");

        rx.recv().await.unwrap().unwrap();
        tx.send(QRecord::new(vec![Value::BigInt(2)])).await.unwrap();
    }
}
