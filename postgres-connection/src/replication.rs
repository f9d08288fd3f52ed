use anyhow::{anyhow, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{self, ScramSha256};
use postgres_protocol::message::{backend, frontend};
use pt::PostgresConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Result of creating a logical replication slot.
#[derive(Debug, Clone)]
pub struct SlotCreationResult {
    pub slot_name: String,
    pub snapshot_name: String,
    pub consistent_point: i64,
}

pub fn format_lsn(lsn: i64) -> String {
    format!("{:X}/{:X}", (lsn as u64) >> 32, (lsn as u64) as u32)
}

pub fn parse_lsn(lsn: &str) -> anyhow::Result<i64> {
    let (hi, lo) = lsn
        .split_once('/')
        .with_context(|| format!("invalid lsn: {}", lsn))?;
    let hi = u64::from_str_radix(hi, 16).with_context(|| format!("invalid lsn: {}", lsn))?;
    let lo = u64::from_str_radix(lo, 16).with_context(|| format!("invalid lsn: {}", lsn))?;
    Ok(((hi << 32) | lo) as i64)
}

/// A connection in replication mode (`replication=database`). Regular
/// queries go through `connect_postgres`; this connection only speaks the
/// replication sub-protocol.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        info!(
            "opening replication connection to {}:{}",
            config.host, config.port
        );
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        let mut stream = BufReader::new(stream);

        let params = [
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "peerdb_flow"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        authenticate(&mut stream, &config.user, &config.password).await?;

        // drain ParameterStatus/BackendKeyData until ReadyForQuery
        loop {
            let (type_code, _body) = read_frame(&mut stream).await?;
            match type_code {
                b'Z' => break,
                b'E' => return Err(anyhow!("error response while waiting for ready")),
                _ => {}
            }
        }

        Ok(Self { stream })
    }

    /// Create a logical slot with the pgoutput plugin, exporting a
    /// consistent snapshot for the initial copy.
    pub async fn create_logical_replication_slot(
        &mut self,
        slot_name: &str,
    ) -> anyhow::Result<SlotCreationResult> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput EXPORT_SNAPSHOT",
            slot_name
        );
        let rows = self.simple_query(&query).await?;
        let row = rows
            .first()
            .ok_or_else(|| anyhow!("CREATE_REPLICATION_SLOT returned no rows"))?;
        // columns: slot_name, consistent_point, snapshot_name, output_plugin
        let consistent_point = row
            .get(1)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| anyhow!("slot creation did not return a consistent point"))?;
        let snapshot_name = row
            .get(2)
            .and_then(|v| v.clone())
            .ok_or_else(|| anyhow!("slot creation did not return a snapshot name"))?;
        Ok(SlotCreationResult {
            slot_name: slot_name.to_owned(),
            snapshot_name,
            consistent_point: parse_lsn(consistent_point)?,
        })
    }

    /// Enter CopyBoth mode, streaming pgoutput messages for the given
    /// publication from `start_lsn`.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        publication_name: &str,
        start_lsn: i64,
    ) -> anyhow::Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot_name,
            format_lsn(start_lsn),
            publication_name
        );

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let (type_code, _body) = read_frame(&mut self.stream).await?;
        match type_code {
            b'W' => {
                info!("entered CopyBoth mode on slot {}", slot_name);
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => Err(anyhow!("failed to start replication on slot {}", slot_name)),
            other => Err(anyhow!(
                "unexpected response to START_REPLICATION: {}",
                other as char
            )),
        }
    }

    /// Run a simple query, collecting DataRow values as text.
    async fn simple_query(&mut self, query: &str) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut rows = Vec::new();
        loop {
            let (type_code, body) = read_frame(&mut self.stream).await?;
            match type_code {
                b'D' => rows.push(parse_data_row(body)?),
                b'Z' => break,
                b'E' => return Err(anyhow!("error response to replication command {}", query)),
                _ => {}
            }
        }
        Ok(rows)
    }
}

/// The CopyBoth half of a replication connection.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Next CopyData payload; `None` on CopyDone.
    pub async fn next_message(&mut self) -> anyhow::Result<Option<Bytes>> {
        let (type_code, body) = read_frame(&mut self.stream).await?;
        match type_code {
            b'd' => Ok(Some(body)),
            b'c' => Ok(None),
            b'E' => Err(anyhow!("error response on replication stream")),
            other => Err(anyhow!(
                "unexpected message on replication stream: {}",
                other as char
            )),
        }
    }

    /// Standby Status Update. Reporting `flush_lsn` releases WAL up to
    /// that point and prevents slot bloat.
    pub async fn send_standby_status_update(&mut self, flush_lsn: i64) -> anyhow::Result<()> {
        debug!("standby status update, flush_lsn={}", format_lsn(flush_lsn));
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(flush_lsn as u64); // written
        payload.put_u64(flush_lsn as u64); // flushed
        payload.put_u64(flush_lsn as u64); // applied
        payload.put_i64(postgres_epoch_micros());
        payload.put_u8(0); // no reply requested

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Microseconds since the Postgres epoch (2000-01-01 00:00:00 UTC).
fn postgres_epoch_micros() -> i64 {
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(946_684_800);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

async fn read_frame(stream: &mut BufReader<TcpStream>) -> anyhow::Result<(u8, Bytes)> {
    let type_code = stream.read_u8().await.context("failed to read frame type")?;
    let len = stream
        .read_i32()
        .await
        .context("failed to read frame length")? as usize;
    if len < 4 {
        return Err(anyhow!("invalid frame length {}", len));
    }
    let mut body = vec![0u8; len - 4];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    Ok((type_code, Bytes::from(body)))
}

fn parse_data_row(mut body: Bytes) -> anyhow::Result<Vec<Option<String>>> {
    let num_cols = body.get_i16();
    let mut row = Vec::with_capacity(num_cols as usize);
    for _ in 0..num_cols {
        let len = body.get_i32();
        if len < 0 {
            row.push(None);
        } else {
            let value = body.split_to(len as usize);
            row.push(Some(String::from_utf8(value.to_vec())?));
        }
    }
    Ok(row)
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: &str,
) -> anyhow::Result<()> {
    loop {
        let (type_code, body) = read_frame(stream).await?;

        let mut raw_msg = BytesMut::with_capacity(1 + 4 + body.len());
        raw_msg.put_u8(type_code);
        raw_msg.put_i32((body.len() + 4) as i32);
        raw_msg.put_slice(&body);

        let msg = backend::Message::parse(&mut raw_msg)?
            .ok_or_else(|| anyhow!("failed to parse auth message"))?;

        match msg {
            backend::Message::AuthenticationOk => {
                debug!("authentication successful");
                return Ok(());
            }
            backend::Message::AuthenticationCleartextPassword => {
                let mut buf = BytesMut::new();
                frontend::password_message(password.as_bytes(), &mut buf)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            backend::Message::AuthenticationMd5Password(md5_body) => {
                let hash = authentication::md5_hash(
                    user.as_bytes(),
                    password.as_bytes(),
                    md5_body.salt(),
                );
                let mut buf = BytesMut::new();
                frontend::password_message(hash.as_bytes(), &mut buf)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            backend::Message::AuthenticationSasl(sasl_body) => {
                let mut has_scram = false;
                let mut mechanisms = sasl_body.mechanisms();
                while let Some(mechanism) = mechanisms.next()? {
                    if mechanism == sasl::SCRAM_SHA_256 {
                        has_scram = true;
                    }
                }
                if !has_scram {
                    return Err(anyhow!("server offered no supported SASL mechanism"));
                }

                let channel_binding = sasl::ChannelBinding::unsupported();
                let mut scram = ScramSha256::new(password.as_bytes(), channel_binding);

                let mut buf = BytesMut::new();
                frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut buf)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;

                let (type_code, body) = read_frame(stream).await?;
                let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
                raw.put_u8(type_code);
                raw.put_i32((body.len() + 4) as i32);
                raw.put_slice(&body);
                match backend::Message::parse(&mut raw)? {
                    Some(backend::Message::AuthenticationSaslContinue(cont)) => {
                        scram.update(cont.data())?;
                    }
                    _ => return Err(anyhow!("expected SASL continue message")),
                }

                let mut buf = BytesMut::new();
                frontend::sasl_response(scram.message(), &mut buf)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;

                let (type_code, body) = read_frame(stream).await?;
                let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
                raw.put_u8(type_code);
                raw.put_i32((body.len() + 4) as i32);
                raw.put_slice(&body);
                match backend::Message::parse(&mut raw)? {
                    Some(backend::Message::AuthenticationSaslFinal(fin)) => {
                        scram.finish(fin.data())?;
                    }
                    _ => return Err(anyhow!("expected SASL final message")),
                }
            }
            backend::Message::ErrorResponse(_) => {
                return Err(anyhow!("authentication rejected by server"));
            }
            _ => {
                return Err(anyhow!(
                    "unexpected message during authentication: {}",
                    type_code as char
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_round_trip() {
        let lsn = parse_lsn("16/B374D848").unwrap();
        assert_eq!(lsn, (0x16u64 << 32 | 0xB374D848) as i64);
        assert_eq!(format_lsn(lsn), "16/B374D848");
    }

    #[test]
    fn lsn_rejects_garbage() {
        assert!(parse_lsn("nope").is_err());
        assert!(parse_lsn("16-B374D848").is_err());
    }

    #[test]
    fn data_row_parsing_handles_nulls() {
        let mut body = BytesMut::new();
        body.put_i16(3);
        body.put_i32(2);
        body.put_slice(b"ab");
        body.put_i32(-1);
        body.put_i32(0);
        let row = parse_data_row(body.freeze()).unwrap();
        assert_eq!(
            row,
            vec![Some("ab".to_owned()), None, Some(String::new())]
        );
    }
}
