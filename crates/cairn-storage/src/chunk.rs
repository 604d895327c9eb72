//! Chunks as seen by callers, the row codec contract and index key codecs.
//!
//! The storage layer treats row payloads as opaque bytes. Row types opt in
//! to typed access by implementing [`Encodable`] and [`Decodable`]; indexes
//! derive their keys through a [`KeyExtractor`] registered when the index is
//! bound to its table.

use bytes::{Buf, Bytes};

use cairn_common::prelude::*;

use crate::data_frame::{ChunkRecord, CHUNK_HEADER_SIZE};

/// A stored row chunk with its physical location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub locator: ChunkLocator,
    pub state: ChunkState,
    pub owner: ObjectId,
    pub payload: Bytes,
}

impl Chunk {
    pub fn from_record(frame: FrameId, record: ChunkRecord) -> Self {
        Self {
            locator: ChunkLocator::new(frame, record.pointer),
            state: record.state,
            owner: record.owner,
            payload: record.payload,
        }
    }

    /// Bytes the chunk occupies in its frame
    pub fn byte_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }

    pub fn is_live(&self) -> bool {
        self.state == ChunkState::Normal
    }

    /// Decode the payload as a typed row.
    pub fn decode<T: Decodable>(&self) -> Result<T> {
        T::decode(&self.payload)
    }
}

/// Serialize a row into a chunk payload
pub trait Encodable {
    fn encode(&self) -> Vec<u8>;
}

/// Rebuild a row from a chunk payload
pub trait Decodable: Sized {
    fn decode(data: &[u8]) -> Result<Self>;
}

impl Encodable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
}

impl Decodable for Vec<u8> {
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(data.to_vec())
    }
}

/// Derives an index key from a row payload
pub trait KeyExtractor: Send + Sync {
    fn key(&self, payload: &[u8]) -> Result<Bytes>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&[u8]) -> Result<Bytes> + Send + Sync,
{
    fn key(&self, payload: &[u8]) -> Result<Bytes> {
        self(payload)
    }
}

/// Encode a numeric id so that byte order equals numeric order.
pub fn encode_id(id: u64) -> Bytes {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

pub fn decode_id(key: &[u8]) -> Result<u64> {
    if key.len() != 8 {
        return Err(Error::invalid_argument(format!(
            "id key must be 8 bytes, got {}",
            key.len()
        )));
    }
    Ok((&key[..]).get_u64())
}

/// Little-endian u64 id stored at a fixed payload offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdColumn {
    pub offset: usize,
}

impl IdColumn {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub fn read(&self, payload: &[u8]) -> Result<u64> {
        let end = self.offset + 8;
        if payload.len() < end {
            return Err(Error::invalid_argument(format!(
                "payload of {} bytes has no id column at {}",
                payload.len(),
                self.offset
            )));
        }
        Ok((&payload[self.offset..end]).get_u64_le())
    }
}

impl KeyExtractor for IdColumn {
    fn key(&self, payload: &[u8]) -> Result<Bytes> {
        Ok(encode_id(self.read(payload)?))
    }
}

/// Raw byte range of the payload used as the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesColumn {
    pub offset: usize,
    pub len: usize,
}

impl BytesColumn {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }
}

impl KeyExtractor for BytesColumn {
    fn key(&self, payload: &[u8]) -> Result<Bytes> {
        let end = self.offset + self.len;
        if payload.len() < end {
            return Err(Error::invalid_argument(format!(
                "payload of {} bytes has no key bytes at {}..{}",
                payload.len(),
                self.offset,
                end
            )));
        }
        Ok(Bytes::copy_from_slice(&payload[self.offset..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::testing::fixtures;

    #[derive(Debug, PartialEq)]
    struct Account {
        id: u64,
        balance: i64,
    }

    impl Encodable for Account {
        fn encode(&self) -> Vec<u8> {
            let mut out = self.id.to_le_bytes().to_vec();
            out.extend_from_slice(&self.balance.to_le_bytes());
            out
        }
    }

    impl Decodable for Account {
        fn decode(data: &[u8]) -> Result<Self> {
            if data.len() != 16 {
                return Err(Error::Serialization(format!("account needs 16 bytes, got {}", data.len())));
            }
            let mut buf = data;
            Ok(Self {
                id: buf.get_u64_le(),
                balance: buf.get_i64_le(),
            })
        }
    }

    #[test]
    fn test_typed_chunk() {
        let account = Account { id: 42, balance: -7 };
        let chunk = Chunk {
            locator: ChunkLocator::new(FrameId::new(FileId(1), 64), 64),
            state: ChunkState::Normal,
            owner: ObjectId(3),
            payload: Bytes::from(account.encode()),
        };
        assert_eq!(chunk.decode::<Account>().unwrap(), account);
        assert_eq!(chunk.byte_len(), 24);
        assert!(chunk.is_live());
    }

    #[test]
    fn test_id_column_orders_numerically() {
        let col = IdColumn::new(0);
        let k2 = col.key(&fixtures::row(2, 16)).unwrap();
        let k10 = col.key(&fixtures::row(10, 16)).unwrap();
        assert!(k2 < k10);
        assert_eq!(decode_id(&k10).unwrap(), 10);
        assert!(col.key(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_bytes_column_and_closure() {
        let col = BytesColumn::new(2, 3);
        assert_eq!(col.key(b"abcdef").unwrap().as_ref(), b"cde");
        assert!(col.key(b"ab").is_err());

        let upper = |payload: &[u8]| -> Result<Bytes> { Ok(Bytes::from(payload.to_ascii_uppercase())) };
        assert_eq!(upper.key(b"key").unwrap().as_ref(), b"KEY");
    }
}
