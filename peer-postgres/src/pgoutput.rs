//! Decoder for pgoutput logical replication messages.

use bytes::{Buf, Bytes};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0}")]
    InvalidType(u8),
    #[error("invalid tuple data kind: {0}")]
    InvalidTupleKind(u8),
    #[error("utf8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin,
    Relation(RelationBody),
    Type,
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate,
}

#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: i64,
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: i64,
    pub end_lsn: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct RelationColumnBody {
    /// Bit 1 marks the column as part of the replica identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone)]
pub struct RelationBody {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumnBody>,
}

impl RelationBody {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone)]
pub enum TupleData {
    Null,
    /// Unchanged TOAST value, not present in the stream.
    Toast,
    Text(Bytes),
}

#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Key columns ('K') or the full old row under REPLICA IDENTITY FULL
    /// ('O'). Absent when the identity did not change.
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Tuple,
}

pub fn decode(data: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    if !data.has_remaining() {
        return Err(DecodeError::NotEnoughData);
    }
    let msg_type = data.get_u8();
    match msg_type {
        b'B' => {
            let final_lsn = data.get_u64() as i64;
            let timestamp = data.get_i64();
            let xid = data.get_u32();
            Ok(PgOutputMessage::Begin(BeginBody {
                final_lsn,
                timestamp,
                xid,
            }))
        }
        b'C' => {
            let flags = data.get_u8();
            let commit_lsn = data.get_u64() as i64;
            let end_lsn = data.get_u64() as i64;
            let timestamp = data.get_i64();
            Ok(PgOutputMessage::Commit(CommitBody {
                flags,
                commit_lsn,
                end_lsn,
                timestamp,
            }))
        }
        b'O' => Ok(PgOutputMessage::Origin),
        b'R' => {
            let relation_id = data.get_u32();
            let namespace = read_cstring(data)?;
            let name = read_cstring(data)?;
            let replica_identity = data.get_u8();
            let num_columns = data.get_u16();
            let mut columns = Vec::with_capacity(num_columns as usize);
            for _ in 0..num_columns {
                let flags = data.get_u8();
                let col_name = read_cstring(data)?;
                let type_oid = data.get_u32();
                let type_modifier = data.get_i32();
                columns.push(RelationColumnBody {
                    flags,
                    name: col_name,
                    type_oid,
                    type_modifier,
                });
            }
            Ok(PgOutputMessage::Relation(RelationBody {
                relation_id,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'Y' => Ok(PgOutputMessage::Type),
        b'I' => {
            let relation_id = data.get_u32();
            let kind = data.get_u8();
            if kind != b'N' {
                return Err(DecodeError::InvalidTupleKind(kind));
            }
            let tuple = read_tuple(data)?;
            Ok(PgOutputMessage::Insert(InsertBody { relation_id, tuple }))
        }
        b'U' => {
            let relation_id = data.get_u32();
            let mut old_tuple = None;
            let mut kind = data.get_u8();
            if kind == b'K' || kind == b'O' {
                old_tuple = Some(read_tuple(data)?);
                kind = data.get_u8();
            }
            if kind != b'N' {
                return Err(DecodeError::InvalidTupleKind(kind));
            }
            let new_tuple = read_tuple(data)?;
            Ok(PgOutputMessage::Update(UpdateBody {
                relation_id,
                old_tuple,
                new_tuple,
            }))
        }
        b'D' => {
            let relation_id = data.get_u32();
            let kind = data.get_u8();
            if kind != b'K' && kind != b'O' {
                return Err(DecodeError::InvalidTupleKind(kind));
            }
            let old_tuple = read_tuple(data)?;
            Ok(PgOutputMessage::Delete(DeleteBody {
                relation_id,
                old_tuple,
            }))
        }
        b'T' => Ok(PgOutputMessage::Truncate),
        t => Err(DecodeError::InvalidType(t)),
    }
}

fn read_cstring(data: &mut Bytes) -> Result<String, DecodeError> {
    let pos = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let s = data.split_to(pos);
    data.advance(1);
    Ok(String::from_utf8(s.to_vec())?)
}

fn read_tuple(data: &mut Bytes) -> Result<Tuple, DecodeError> {
    let num_columns = data.get_u16();
    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let kind = data.get_u8();
        match kind {
            b'n' => columns.push(TupleData::Null),
            b'u' => columns.push(TupleData::Toast),
            b't' => {
                let len = data.get_i32() as usize;
                if data.remaining() < len {
                    return Err(DecodeError::NotEnoughData);
                }
                columns.push(TupleData::Text(data.split_to(len)));
            }
            other => return Err(DecodeError::InvalidTupleKind(other)),
        }
    }
    Ok(Tuple(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_cstring(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    fn relation_message() -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(16384);
        put_cstring(&mut buf, "public");
        put_cstring(&mut buf, "t");
        buf.put_u8(b'd');
        buf.put_u16(2);
        buf.put_u8(1);
        put_cstring(&mut buf, "id");
        buf.put_u32(23); // int4
        buf.put_i32(-1);
        buf.put_u8(0);
        put_cstring(&mut buf, "v");
        buf.put_u32(25); // text
        buf.put_i32(-1);
        buf.freeze()
    }

    #[test]
    fn decodes_relation() {
        let mut data = relation_message();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Relation(rel) => {
                assert_eq!(rel.relation_id, 16384);
                assert_eq!(rel.qualified_name(), "public.t");
                assert_eq!(rel.columns.len(), 2);
                assert_eq!(rel.columns[0].name, "id");
                assert_eq!(rel.columns[0].flags, 1);
                assert_eq!(rel.columns[1].type_oid, 25);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decodes_insert_with_nulls() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(16384);
        buf.put_u8(b'N');
        buf.put_u16(2);
        buf.put_u8(b't');
        buf.put_i32(1);
        buf.put_slice(b"1");
        buf.put_u8(b'n');
        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Insert(ins) => {
                assert_eq!(ins.relation_id, 16384);
                assert!(matches!(&ins.tuple.0[0], TupleData::Text(b) if &b[..] == b"1"));
                assert!(matches!(ins.tuple.0[1], TupleData::Null));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decodes_update_with_old_tuple() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(16384);
        buf.put_u8(b'O');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_i32(1);
        buf.put_slice(b"a");
        buf.put_u8(b'N');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_i32(1);
        buf.put_slice(b"b");
        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Update(upd) => {
                assert!(upd.old_tuple.is_some());
                assert!(matches!(&upd.new_tuple.0[0], TupleData::Text(b) if &b[..] == b"b"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn decodes_begin_and_commit() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(100);
        buf.put_i64(0);
        buf.put_u32(777);
        let mut data = buf.freeze();
        assert!(matches!(
            decode(&mut data).unwrap(),
            PgOutputMessage::Begin(BeginBody { final_lsn: 100, xid: 777, .. })
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(100);
        buf.put_u64(101);
        buf.put_i64(0);
        let mut data = buf.freeze();
        assert!(matches!(
            decode(&mut data).unwrap(),
            PgOutputMessage::Commit(CommitBody { commit_lsn: 100, end_lsn: 101, .. })
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut data = Bytes::from_static(b"Zxx");
        assert!(matches!(
            decode(&mut data),
            Err(DecodeError::InvalidType(b'Z'))
        ));
    }
}
