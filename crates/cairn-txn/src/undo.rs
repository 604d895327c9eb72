//! Undo chunks and the undo frames that hold them.
//!
//! Every pre-image a transaction saves is serialized into an [`UndoChunk`]
//! and appended to one of the transaction's undo frames. Rollback reads the
//! chunks back from those frames; concurrent readers do the same to see the
//! version a writer replaced.
//!
//! Record Layout:
//! ```text
//! +--------+---------+-----------+----------+-----------+---------+-------------+
//! | tag u8 | key u64 | txn u64   | stmt u32 | table u32 | loc 10B | image bytes |
//! +--------+---------+-----------+----------+-----------+---------+-------------+
//! ```
//!
//! Image bytes by tag: `Absent` has none; `Row` is state u8, owner u32,
//! payload len u32 and payload; index images are key len u16, key and the
//! row locator.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_common::utils::round_up;
use cairn_storage::{FrameData, StorageEngine, UndoImage, CHUNK_HEADER_SIZE};

const TAG_ABSENT: u8 = 0;
const TAG_ROW: u8 = 1;
const TAG_INDEX_INSERT: u8 = 2;
const TAG_INDEX_REMOVE: u8 = 3;

const FIXED_SIZE: usize = 1 + 8 + 8 + 4 + 4 + LOCATOR_SIZE;

/// Where an undo chunk was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UndoRef {
    pub frame: FrameId,
    pub pointer: u16,
}

/// One saved pre-image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoChunk {
    /// Creation order within the transaction
    pub key: u64,
    pub txn: TxnId,
    /// Statement counter when the chunk was saved
    pub statement: u32,
    pub table: ObjectId,
    pub locator: ChunkLocator,
    pub image: UndoImage,
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Serialization(format!("undo chunk: {}", reason.into()))
}

impl UndoChunk {
    /// Serialize the chunk. Fails when a payload or key is longer than its
    /// length field can record.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let tag = match &self.image {
            UndoImage::Absent => TAG_ABSENT,
            UndoImage::Row { .. } => TAG_ROW,
            UndoImage::IndexInsert { .. } => TAG_INDEX_INSERT,
            UndoImage::IndexRemove { .. } => TAG_INDEX_REMOVE,
        };
        buf.put_u8(tag);
        buf.put_u64_le(self.key);
        buf.put_u64_le(self.txn.0);
        buf.put_u32_le(self.statement);
        buf.put_u32_le(self.table.0);
        buf.put_slice(&self.locator.encode());
        match &self.image {
            UndoImage::Absent => {}
            UndoImage::Row { state, owner, payload } => {
                buf.put_u8(*state as u8);
                buf.put_u32_le(owner.0);
                let len = u32::try_from(payload.len())
                    .map_err(|_| malformed(format!("row payload of {} bytes", payload.len())))?;
                buf.put_u32_le(len);
                buf.put_slice(payload);
            }
            UndoImage::IndexInsert { key, row } | UndoImage::IndexRemove { key, row } => {
                let len = u16::try_from(key.len())
                    .map_err(|_| malformed(format!("index key of {} bytes", key.len())))?;
                buf.put_u16_le(len);
                buf.put_slice(key);
                buf.put_slice(&row.encode());
            }
        }
        Ok(buf.freeze())
    }

    pub fn encoded_len(&self) -> usize {
        FIXED_SIZE
            + match &self.image {
                UndoImage::Absent => 0,
                UndoImage::Row { payload, .. } => 1 + 4 + 4 + payload.len(),
                UndoImage::IndexInsert { key, .. } | UndoImage::IndexRemove { key, .. } => {
                    2 + key.len() + LOCATOR_SIZE
                }
            }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_SIZE {
            return Err(malformed(format!("{} bytes is truncated", data.len())));
        }
        let mut buf = data;
        let tag = buf.get_u8();
        let key = buf.get_u64_le();
        let txn = TxnId(buf.get_u64_le());
        let statement = buf.get_u32_le();
        let table = ObjectId(buf.get_u32_le());
        let locator = ChunkLocator::decode(buf).ok_or_else(|| malformed("bad locator"))?;
        buf.advance(LOCATOR_SIZE);

        let image = match tag {
            TAG_ABSENT => UndoImage::Absent,
            TAG_ROW => {
                if buf.remaining() < 9 {
                    return Err(malformed("row image is truncated"));
                }
                let state = ChunkState::try_from(buf.get_u8())?;
                let owner = ObjectId(buf.get_u32_le());
                let len = buf.get_u32_le() as usize;
                if buf.remaining() != len {
                    return Err(malformed(format!("row payload is {} bytes, record says {}", buf.remaining(), len)));
                }
                UndoImage::Row {
                    state,
                    owner,
                    payload: Bytes::copy_from_slice(buf),
                }
            }
            TAG_INDEX_INSERT | TAG_INDEX_REMOVE => {
                if buf.remaining() < 2 {
                    return Err(malformed("index image is truncated"));
                }
                let len = buf.get_u16_le() as usize;
                if buf.remaining() != len + LOCATOR_SIZE {
                    return Err(malformed("index image length mismatch"));
                }
                let key = Bytes::copy_from_slice(&buf[..len]);
                let row = ChunkLocator::decode(&buf[len..]).ok_or_else(|| malformed("bad row locator"))?;
                if tag == TAG_INDEX_INSERT {
                    UndoImage::IndexInsert { key, row }
                } else {
                    UndoImage::IndexRemove { key, row }
                }
            }
            other => return Err(malformed(format!("unknown tag {}", other))),
        };

        Ok(Self {
            key,
            txn,
            statement,
            table,
            locator,
            image,
        })
    }
}

/// Read an undo chunk back from its frame.
pub fn read_undo(engine: &StorageEngine, at: UndoRef) -> Result<UndoChunk> {
    let frame = engine.frame(at.frame)?;
    let record = engine.read_chunk(&frame, at.pointer)?;
    UndoChunk::decode(&record.payload)
}

/// The undo frames of one transaction.
///
/// Frames are filled round robin; a full frame is replaced by a fresh one.
/// A chunk too large for the configured frame size gets a frame of its own.
#[derive(Debug, Default)]
pub struct UndoLog {
    frames: Vec<Arc<FrameData>>,
    /// Every frame ever used, in allocation order
    used: Vec<FrameId>,
    cursor: usize,
    next_key: u64,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the initial frames, one per undo partition.
    pub fn start(&mut self, engine: &StorageEngine) -> Result<()> {
        let config = &engine.config().transaction;
        let count = config.undo_partitions.max(1);
        for _ in 0..count {
            let frame = engine.allocate_undo_frame(config.undo_frame_size)?;
            self.used.push(frame.id());
            self.frames.push(frame);
        }
        Ok(())
    }

    /// Key for the next chunk
    pub fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    /// Write `chunk` into an undo frame.
    pub fn append(&mut self, engine: &StorageEngine, chunk: &UndoChunk) -> Result<UndoRef> {
        let payload = chunk.encode()?;
        let frame_size = engine.config().transaction.undo_frame_size;
        let needed = CHUNK_HEADER_SIZE + payload.len();

        if needed > frame_size as usize - FRAME_HEADER_SIZE {
            let size = round_up((needed + FRAME_HEADER_SIZE + 8) as u64, 256) as u32;
            let frame = engine.allocate_undo_frame(size)?;
            self.used.push(frame.id());
            let pointer = engine
                .append_undo(&frame, &payload)?
                .ok_or_else(|| Error::internal("undo chunk does not fit its dedicated frame"))?;
            trace!(frame = %frame.id(), size, "dedicated undo frame");
            return Ok(UndoRef {
                frame: frame.id(),
                pointer,
            });
        }

        if self.frames.is_empty() {
            self.start(engine)?;
        }
        let slot = self.cursor % self.frames.len();
        self.cursor = self.cursor.wrapping_add(1);
        let frame = Arc::clone(&self.frames[slot]);
        if let Some(pointer) = engine.append_undo(&frame, &payload)? {
            return Ok(UndoRef {
                frame: frame.id(),
                pointer,
            });
        }

        let fresh = engine.allocate_undo_frame(frame_size)?;
        self.used.push(fresh.id());
        self.frames[slot] = Arc::clone(&fresh);
        let pointer = engine
            .append_undo(&fresh, &payload)?
            .ok_or_else(|| Error::internal("undo chunk does not fit a fresh undo frame"))?;
        Ok(UndoRef {
            frame: fresh.id(),
            pointer,
        })
    }

    /// Hand back every frame ever used and forget them.
    pub fn take_frames(&mut self) -> Vec<FrameId> {
        self.frames.clear();
        self.cursor = 0;
        let mut frames = std::mem::take(&mut self.used);
        frames.sort();
        frames.dedup();
        frames
    }

    pub fn frame_count(&self) -> usize {
        self.used.len()
    }

    pub fn frame_ids(&self) -> &[FrameId] {
        &self.used
    }
}
