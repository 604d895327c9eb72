//! Chunk layout shared by data and undo frames.
//!
//! Chunks are appended after the frame header and never move, so a
//! [`ChunkLocator`] stays valid for the life of the frame. Removing a chunk
//! turns it into a hole of the same length; `fill` only grows.
//!
//! Chunk Layout:
//! ```text
//! +-------+-------+---------+----------+-----------------+
//! | state | flags | len u16 | owner u32| payload (len B) |
//! +-------+-------+---------+----------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes};

use cairn_common::prelude::*;

use crate::frame::FRAME_HEADER_SIZE;

/// Chunk header size: 8 bytes
pub const CHUNK_HEADER_SIZE: usize = 8;

/// State byte of a removed chunk
pub const HOLE: u8 = 0xFF;

/// A chunk as stored in a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub pointer: u16,
    pub state: ChunkState,
    pub flags: u8,
    pub owner: ObjectId,
    pub payload: Bytes,
}

impl ChunkRecord {
    /// Bytes this chunk occupies, header included
    pub fn byte_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }
}

/// Body of a data or undo frame
#[derive(Debug, Clone)]
pub struct DataFrame {
    /// Bytes after the frame header
    body: Vec<u8>,
    /// End of written content, in frame coordinates
    fill: usize,
    /// Start of every record (holes included), in frame coordinates
    offsets: Vec<u16>,
}

impl DataFrame {
    pub fn new(capacity: usize) -> Self {
        Self {
            body: vec![0u8; capacity],
            fill: FRAME_HEADER_SIZE,
            offsets: Vec::new(),
        }
    }

    /// Rebuild from an on-disk body, walking every record up to `fill`.
    pub fn decode(body: &[u8], fill: usize, chunk_count: u16) -> Result<Self> {
        if fill < FRAME_HEADER_SIZE || fill - FRAME_HEADER_SIZE > body.len() {
            return Err(Error::consistency(format!(
                "fill {} outside frame body of {} bytes",
                fill,
                body.len()
            )));
        }

        let mut offsets = Vec::with_capacity(chunk_count as usize);
        let mut pos = FRAME_HEADER_SIZE;
        while pos < fill {
            let at = pos - FRAME_HEADER_SIZE;
            if at + CHUNK_HEADER_SIZE > fill - FRAME_HEADER_SIZE {
                return Err(Error::consistency(format!("truncated chunk header at {}", pos)));
            }
            let state = body[at];
            if state != HOLE {
                ChunkState::try_from(state)?;
            }
            let len = (&body[at + 2..at + 4]).get_u16_le() as usize;
            offsets.push(pos as u16);
            pos += CHUNK_HEADER_SIZE + len;
        }
        if pos != fill {
            return Err(Error::consistency(format!(
                "chunk walk ended at {}, header says fill {}",
                pos, fill
            )));
        }
        if offsets.len() != chunk_count as usize {
            return Err(Error::consistency(format!(
                "found {} chunks, header says {}",
                offsets.len(),
                chunk_count
            )));
        }

        Ok(Self {
            body: body.to_vec(),
            fill,
            offsets,
        })
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Records written so far, holes included
    pub fn chunk_count(&self) -> u16 {
        self.offsets.len() as u16
    }

    pub fn free_space(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len() - self.fill
    }

    pub fn fits(&self, payload_len: usize) -> bool {
        CHUNK_HEADER_SIZE + payload_len <= self.free_space()
    }

    /// Append a chunk; `None` when the frame is full.
    pub fn append(&mut self, state: ChunkState, owner: ObjectId, payload: &[u8]) -> Option<u16> {
        if !self.fits(payload.len()) || payload.len() > u16::MAX as usize {
            return None;
        }
        let pointer = self.fill as u16;
        self.write_record(pointer, state as u8, 0, owner, payload);
        self.offsets.push(pointer);
        self.fill += CHUNK_HEADER_SIZE + payload.len();
        Some(pointer)
    }

    fn write_record(&mut self, pointer: u16, state: u8, flags: u8, owner: ObjectId, payload: &[u8]) {
        let at = pointer as usize - FRAME_HEADER_SIZE;
        let mut buf = &mut self.body[at..at + CHUNK_HEADER_SIZE];
        buf.put_u8(state);
        buf.put_u8(flags);
        buf.put_u16_le(payload.len() as u16);
        buf.put_u32_le(owner.0);
        let start = at + CHUNK_HEADER_SIZE;
        self.body[start..start + payload.len()].copy_from_slice(payload);
    }

    fn locate(&self, pointer: u16) -> Result<usize> {
        self.offsets
            .binary_search(&pointer)
            .map(|_| pointer as usize - FRAME_HEADER_SIZE)
            .map_err(|_| Error::consistency(format!("no chunk starts at pointer {}", pointer)))
    }

    fn record_len(&self, at: usize) -> usize {
        (&self.body[at + 2..at + 4]).get_u16_le() as usize
    }

    fn is_hole_at(&self, at: usize) -> bool {
        self.body[at] == HOLE
    }

    fn read_at(&self, pointer: u16, at: usize) -> Result<ChunkRecord> {
        let mut buf = &self.body[at..at + CHUNK_HEADER_SIZE];
        let state = ChunkState::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let len = buf.get_u16_le() as usize;
        let owner = ObjectId(buf.get_u32_le());
        let start = at + CHUNK_HEADER_SIZE;
        Ok(ChunkRecord {
            pointer,
            state,
            flags,
            owner,
            payload: Bytes::copy_from_slice(&self.body[start..start + len]),
        })
    }

    /// Read the chunk at `pointer`. A hole reports `DeletedRecord`.
    pub fn get(&self, pointer: u16) -> Result<ChunkRecord> {
        let at = self.locate(pointer)?;
        if self.is_hole_at(at) {
            return Err(Error::Storage(StorageError::DeletedRecord(format!(
                "chunk at {} was removed",
                pointer
            ))));
        }
        self.read_at(pointer, at)
    }

    pub fn set_state(&mut self, pointer: u16, state: ChunkState) -> Result<()> {
        let at = self.locate(pointer)?;
        if self.is_hole_at(at) {
            return Err(Error::Storage(StorageError::DeletedRecord(format!(
                "chunk at {} was removed",
                pointer
            ))));
        }
        self.body[at] = state as u8;
        Ok(())
    }

    /// Replace the payload of a chunk with one of the same length.
    pub fn overwrite(&mut self, pointer: u16, payload: &[u8]) -> Result<()> {
        let at = self.locate(pointer)?;
        let len = self.record_len(at);
        if len != payload.len() {
            return Err(Error::invalid_argument(format!(
                "in-place rewrite needs {} bytes, got {}",
                len,
                payload.len()
            )));
        }
        if self.is_hole_at(at) {
            return Err(Error::Storage(StorageError::DeletedRecord(format!(
                "chunk at {} was removed",
                pointer
            ))));
        }
        let start = at + CHUNK_HEADER_SIZE;
        self.body[start..start + len].copy_from_slice(payload);
        Ok(())
    }

    /// Turn a chunk into a hole and return its byte length.
    ///
    /// Removing a hole again returns 0.
    pub fn remove(&mut self, pointer: u16) -> Result<usize> {
        let at = self.locate(pointer)?;
        if self.is_hole_at(at) {
            return Ok(0);
        }
        let len = self.record_len(at);
        self.body[at] = HOLE;
        self.body[at + 1] = 0;
        self.body[at + 4..at + CHUNK_HEADER_SIZE].fill(0);
        let start = at + CHUNK_HEADER_SIZE;
        self.body[start..start + len].fill(0);
        Ok(CHUNK_HEADER_SIZE + len)
    }

    /// Write a saved image back over the record at `pointer`.
    pub fn restore(&mut self, pointer: u16, state: ChunkState, flags: u8, owner: ObjectId, payload: &[u8]) -> Result<()> {
        let at = self.locate(pointer)?;
        let len = self.record_len(at);
        if len != payload.len() {
            return Err(Error::consistency(format!(
                "pre-image of {} bytes does not fit record of {} bytes at {}",
                payload.len(),
                len,
                pointer
            )));
        }
        self.write_record(pointer, state as u8, flags, owner, payload);
        Ok(())
    }

    /// Every chunk that still occupies space, in pointer order.
    pub fn chunks(&self) -> Result<Vec<ChunkRecord>> {
        let mut out = Vec::with_capacity(self.offsets.len());
        for &pointer in &self.offsets {
            let at = pointer as usize - FRAME_HEADER_SIZE;
            if !self.is_hole_at(at) {
                out.push(self.read_at(pointer, at)?);
            }
        }
        Ok(out)
    }

    /// Sum of byte lengths of chunks that are not holes
    pub fn live_bytes(&self) -> usize {
        self.offsets
            .iter()
            .map(|&p| p as usize - FRAME_HEADER_SIZE)
            .filter(|&at| !self.is_hole_at(at))
            .map(|at| CHUNK_HEADER_SIZE + self.record_len(at))
            .sum()
    }

    /// Whether any chunk still occupies space
    pub fn has_chunks(&self) -> bool {
        self.offsets
            .iter()
            .any(|&p| !self.is_hole_at(p as usize - FRAME_HEADER_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 192;

    #[test]
    fn test_append_and_get() {
        let mut frame = DataFrame::new(CAPACITY);
        let p1 = frame.append(ChunkState::Normal, ObjectId(3), b"hello").unwrap();
        let p2 = frame.append(ChunkState::Normal, ObjectId(3), b"world!").unwrap();
        assert_eq!(p1 as usize, FRAME_HEADER_SIZE);
        assert_eq!(p2 as usize, FRAME_HEADER_SIZE + CHUNK_HEADER_SIZE + 5);

        let chunk = frame.get(p2).unwrap();
        assert_eq!(chunk.payload.as_ref(), b"world!");
        assert_eq!(chunk.owner, ObjectId(3));
        assert_eq!(chunk.byte_len(), 14);
        assert_eq!(frame.live_bytes(), 13 + 14);
    }

    #[test]
    fn test_twelve_sixteen_byte_chunks_fill_a_small_frame() {
        let mut frame = DataFrame::new(CAPACITY);
        for i in 0..12u64 {
            assert!(frame.append(ChunkState::Normal, ObjectId(1), &i.to_le_bytes()).is_some());
        }
        assert!(frame.append(ChunkState::Normal, ObjectId(1), &[0u8; 8]).is_none());
        assert_eq!(frame.free_space(), 0);
    }

    #[test]
    fn test_remove_leaves_hole() {
        let mut frame = DataFrame::new(CAPACITY);
        let p1 = frame.append(ChunkState::Normal, ObjectId(1), b"aaaa").unwrap();
        let p2 = frame.append(ChunkState::Normal, ObjectId(1), b"bbbb").unwrap();

        assert_eq!(frame.remove(p1).unwrap(), 12);
        assert_eq!(frame.remove(p1).unwrap(), 0);
        assert!(frame.get(p1).is_err());
        assert_eq!(frame.get(p2).unwrap().payload.as_ref(), b"bbbb");
        assert_eq!(frame.chunks().unwrap().len(), 1);
        assert!(frame.has_chunks());

        frame.remove(p2).unwrap();
        assert!(!frame.has_chunks());
        assert_eq!(frame.chunk_count(), 2);
    }

    #[test]
    fn test_restore_is_byte_identical() {
        let mut frame = DataFrame::new(CAPACITY);
        let p = frame.append(ChunkState::Normal, ObjectId(5), b"original").unwrap();
        let before = frame.body().to_vec();

        frame.overwrite(p, b"modified").unwrap();
        frame.set_state(p, ChunkState::Deleted).unwrap();
        frame.restore(p, ChunkState::Normal, 0, ObjectId(5), b"original").unwrap();
        assert_eq!(frame.body(), &before[..]);

        frame.remove(p).unwrap();
        frame.restore(p, ChunkState::Normal, 0, ObjectId(5), b"original").unwrap();
        assert_eq!(frame.body(), &before[..]);
    }

    #[test]
    fn test_overwrite_rejects_length_change() {
        let mut frame = DataFrame::new(CAPACITY);
        let p = frame.append(ChunkState::Normal, ObjectId(1), b"abc").unwrap();
        assert!(frame.overwrite(p, b"abcd").is_err());
        assert!(frame.get(p + 1).is_err());
    }

    #[test]
    fn test_decode_round_trip() {
        let mut frame = DataFrame::new(CAPACITY);
        frame.append(ChunkState::Normal, ObjectId(1), b"one").unwrap();
        let p = frame.append(ChunkState::Archived, ObjectId(1), b"two").unwrap();
        frame.append(ChunkState::Normal, ObjectId(1), b"three").unwrap();
        frame.remove(p).unwrap();

        let decoded = DataFrame::decode(frame.body(), frame.fill(), frame.chunk_count()).unwrap();
        assert_eq!(decoded.chunks().unwrap(), frame.chunks().unwrap());
        assert_eq!(decoded.live_bytes(), frame.live_bytes());

        assert!(DataFrame::decode(frame.body(), frame.fill(), 7).is_err());
        assert!(DataFrame::decode(frame.body(), frame.fill() - 1, 3).is_err());
    }
}
