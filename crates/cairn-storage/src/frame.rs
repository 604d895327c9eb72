//! Frame headers, frame metadata and the frame content variant.
//!
//! Frame Layout:
//! ```text
//! +----------------------+  0x00
//! | FrameHeader (64B)    |
//! +----------------------+  0x40
//! | body                 |  DataFrame chunks or IndexFrame entries
//! | ...                  |
//! +----------------------+  size
//! ```
//!
//! Every frame starts with its own identity (file id, pointer, object id) so a
//! misdirected write can be detected before it lands.

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use cairn_common::prelude::*;
use cairn_common::utils::{crc32, verify_crc32};

use crate::data_frame::DataFrame;
use crate::index_frame::IndexFrame;

pub use cairn_common::config::FRAME_HEADER_SIZE;

/// Offset of the CRC inside the header
const HEADER_CRC_OFFSET: usize = 60;

/// Frame header flags
pub mod frame_flags {
    /// Installed in a WaitFrame slot as the append target
    pub const CURRENT: u8 = 0x01;
    /// Owned by a table or transaction (cleared when the frame is freed)
    pub const ALLOCATED: u8 = 0x02;
    /// Root of an index tree
    pub const ROOT: u8 = 0x04;
}

/// What a frame holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Never written as anything but an unallocated placeholder
    Free = 0,
    /// Row chunks
    Data = 1,
    /// B+tree leaf
    IndexLeaf = 2,
    /// B+tree interior node
    IndexNode = 3,
    /// Undo chunks of a transaction
    Undo = 4,
}

impl FrameKind {
    pub fn is_index(&self) -> bool {
        matches!(self, FrameKind::IndexLeaf | FrameKind::IndexNode)
    }

    /// Data and undo frames share the chunk layout
    pub fn holds_chunks(&self) -> bool {
        matches!(self, FrameKind::Data | FrameKind::Undo)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Free),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::IndexLeaf),
            3 => Ok(FrameKind::IndexNode),
            4 => Ok(FrameKind::Undo),
            other => Err(Error::consistency(format!("invalid frame kind {}", other))),
        }
    }
}

/// Frame header (64 bytes, fixed layout)
///
/// Layout:
/// - file_id: u32, pointer: u64 - self-describing identity
/// - object_id: u32 - owning table
/// - kind: u8, flags: u8, chunk_count: u16
/// - size: u32, used: u32, fill: u32 - reserved bytes, live bytes, end of written content
/// - prev: u64, next: u64 - chain links in combined frame-id form
/// - alloc_id: u64
/// - started: u32 - source node id plus one for a remote chain start, 0 otherwise
/// - crc: u32 over bytes 0..60
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: FrameId,
    pub object_id: ObjectId,
    pub kind: FrameKind,
    pub flags: u8,
    pub chunk_count: u16,
    pub size: u32,
    pub used: u32,
    pub fill: u32,
    pub prev: FrameId,
    pub next: FrameId,
    pub alloc_id: AllocId,
    pub started: u32,
}

impl FrameHeader {
    pub fn new(id: FrameId, object_id: ObjectId, kind: FrameKind, size: u32, alloc_id: AllocId) -> Self {
        Self {
            id,
            object_id,
            kind,
            flags: frame_flags::ALLOCATED,
            chunk_count: 0,
            size,
            used: 0,
            fill: FRAME_HEADER_SIZE as u32,
            prev: FrameId::NONE,
            next: FrameId::NONE,
            alloc_id,
            started: 0,
        }
    }

    /// Placeholder written when a file is extended: lets a scan step over the
    /// slot before its owner has written the real header.
    pub fn unallocated(id: FrameId, size: u32) -> Self {
        let mut header = Self::new(id, ObjectId(0), FrameKind::Free, size, AllocId(0));
        header.flags = 0;
        header
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        {
            let mut buf = &mut out[..];
            buf.put_u32_le(self.id.file.0);
            buf.put_u64_le(self.id.pointer);
            buf.put_u32_le(self.object_id.0);
            buf.put_u8(self.kind as u8);
            buf.put_u8(self.flags);
            buf.put_u16_le(self.chunk_count);
            buf.put_u32_le(self.size);
            buf.put_u32_le(self.used);
            buf.put_u32_le(self.fill);
            buf.put_u64_le(self.prev.to_u64());
            buf.put_u64_le(self.next.to_u64());
            buf.put_u64_le(self.alloc_id.0);
            buf.put_u32_le(self.started);
        }
        let crc = crc32(&out[..HEADER_CRC_OFFSET]);
        out[HEADER_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::consistency("frame header too short"));
        }
        let stored = (&data[HEADER_CRC_OFFSET..FRAME_HEADER_SIZE]).get_u32_le();
        if !verify_crc32(&data[..HEADER_CRC_OFFSET], stored) {
            let mut buf = data;
            let file = buf.get_u32_le();
            let pointer = buf.get_u64_le();
            return Err(Error::corrupted(
                FrameId::new(FileId(file), pointer).to_u64(),
                "header checksum mismatch",
            ));
        }

        let mut buf = data;
        let file = FileId(buf.get_u32_le());
        let pointer = buf.get_u64_le();
        let object_id = ObjectId(buf.get_u32_le());
        let kind = FrameKind::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let chunk_count = buf.get_u16_le();
        let size = buf.get_u32_le();
        let used = buf.get_u32_le();
        let fill = buf.get_u32_le();
        let prev = FrameId::from_u64(buf.get_u64_le());
        let next = FrameId::from_u64(buf.get_u64_le());
        let alloc_id = AllocId(buf.get_u64_le());
        let started = buf.get_u32_le();

        Ok(Self {
            id: FrameId::new(file, pointer),
            object_id,
            kind,
            flags,
            chunk_count,
            size,
            used,
            fill,
            prev,
            next,
            alloc_id,
            started,
        })
    }
}

/// Live content of a frame, loaded lazily from disk.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(DataFrame),
    Index(IndexFrame),
}

impl Frame {
    /// Fresh content for a newly allocated frame.
    pub fn empty(kind: FrameKind, capacity: usize) -> Self {
        match kind {
            FrameKind::IndexLeaf => Frame::Index(IndexFrame::new(true)),
            FrameKind::IndexNode => Frame::Index(IndexFrame::new(false)),
            _ => Frame::Data(DataFrame::new(capacity)),
        }
    }

    /// Parse the body that follows `header`.
    pub fn decode(header: &FrameHeader, body: &[u8]) -> Result<Self> {
        if header.kind.is_index() {
            Ok(Frame::Index(IndexFrame::decode(body, header.chunk_count as usize).map_err(|e| {
                Error::corrupted(header.id.to_u64(), e.to_string())
            })?))
        } else {
            Ok(Frame::Data(
                DataFrame::decode(body, header.fill as usize, header.chunk_count)
                    .map_err(|e| Error::corrupted(header.id.to_u64(), e.to_string()))?,
            ))
        }
    }

    /// Body bytes padded to `capacity`.
    pub fn encode_body(&self, capacity: usize) -> Vec<u8> {
        match self {
            Frame::Data(data) => data.body().to_vec(),
            Frame::Index(index) => {
                let mut body = index.encode();
                body.resize(capacity, 0);
                body
            }
        }
    }

    /// End of written content, in frame coordinates
    pub fn fill(&self) -> u32 {
        match self {
            Frame::Data(data) => data.fill() as u32,
            Frame::Index(index) => (FRAME_HEADER_SIZE + index.encoded_len()) as u32,
        }
    }

    pub fn chunk_count(&self) -> u16 {
        match self {
            Frame::Data(data) => data.chunk_count(),
            Frame::Index(index) => index.len() as u16,
        }
    }

    pub fn as_data(&self) -> Result<&DataFrame> {
        match self {
            Frame::Data(data) => Ok(data),
            Frame::Index(_) => Err(Error::consistency("expected a data frame, found an index frame")),
        }
    }

    pub fn as_data_mut(&mut self) -> Result<&mut DataFrame> {
        match self {
            Frame::Data(data) => Ok(data),
            Frame::Index(_) => Err(Error::consistency("expected a data frame, found an index frame")),
        }
    }

    pub fn as_index(&self) -> Result<&IndexFrame> {
        match self {
            Frame::Index(index) => Ok(index),
            Frame::Data(_) => Err(Error::consistency("expected an index frame, found a data frame")),
        }
    }

    pub fn as_index_mut(&mut self) -> Result<&mut IndexFrame> {
        match self {
            Frame::Index(index) => Ok(index),
            Frame::Data(_) => Err(Error::consistency("expected an index frame, found a data frame")),
        }
    }
}

/// Frame metadata: identity, size accounting, chain links and flags.
///
/// The header is the authoritative in-memory copy of what the LLT flushes.
/// Content is cached separately and may be dropped and reloaded at any time;
/// `alloc_id` survives that.
#[derive(Debug)]
pub struct FrameData {
    id: FrameId,
    size: u32,
    alloc_id: AllocId,
    header: Mutex<FrameHeader>,
    /// Live transactions holding a pre-image of this frame
    tcounter: AtomicUsize,
    content: Mutex<Option<Frame>>,
}

impl FrameData {
    pub fn new(header: FrameHeader) -> Self {
        Self {
            id: header.id,
            size: header.size,
            alloc_id: header.alloc_id,
            header: Mutex::new(header),
            tcounter: AtomicUsize::new(0),
            content: Mutex::new(None),
        }
    }

    /// Metadata with its content already materialized.
    pub fn with_content(header: FrameHeader, content: Frame) -> Self {
        let frame = Self::new(header);
        *frame.content.lock() = Some(content);
        frame
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Body bytes available after the header
    pub fn capacity(&self) -> usize {
        self.size as usize - FRAME_HEADER_SIZE
    }

    pub fn alloc_id(&self) -> AllocId {
        self.alloc_id
    }

    /// Snapshot of the header.
    pub fn header(&self) -> FrameHeader {
        *self.header.lock()
    }

    pub fn update_header<R>(&self, f: impl FnOnce(&mut FrameHeader) -> R) -> R {
        f(&mut self.header.lock())
    }

    pub fn object_id(&self) -> ObjectId {
        self.header.lock().object_id
    }

    pub fn kind(&self) -> FrameKind {
        self.header.lock().kind
    }

    pub fn used(&self) -> u32 {
        self.header.lock().used
    }

    pub fn prev(&self) -> FrameId {
        self.header.lock().prev
    }

    pub fn next(&self) -> FrameId {
        self.header.lock().next
    }

    pub fn started(&self) -> u32 {
        self.header.lock().started
    }

    pub fn is_current(&self) -> bool {
        self.header.lock().has_flag(frame_flags::CURRENT)
    }

    pub fn is_allocated(&self) -> bool {
        self.header.lock().has_flag(frame_flags::ALLOCATED)
    }

    pub fn is_root(&self) -> bool {
        self.header.lock().has_flag(frame_flags::ROOT)
    }

    pub fn set_current(&self, on: bool) {
        self.header.lock().set_flag(frame_flags::CURRENT, on);
    }

    /// Apply a signed delta to `used`, clamped to `0..=size`.
    ///
    /// Returns the new value and whether the delta had to be clamped.
    pub fn adjust_used(&self, delta: i64) -> (u32, bool) {
        let mut header = self.header.lock();
        let target = header.used as i64 + delta;
        let clamped = target.clamp(0, header.size as i64);
        header.used = clamped as u32;
        (header.used, clamped != target)
    }

    pub fn tcounter(&self) -> usize {
        self.tcounter.load(Ordering::SeqCst)
    }

    pub fn retain_txn(&self) -> usize {
        self.tcounter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one transaction reference; never goes below zero.
    pub fn release_txn(&self) -> usize {
        let mut current = self.tcounter.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.tcounter.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn content(&self) -> &Mutex<Option<Frame>> {
        &self.content
    }

    pub fn is_loaded(&self) -> bool {
        self.content.lock().is_some()
    }

    /// Drop cached content if nobody is using it.
    pub fn evict_content(&self) -> bool {
        match self.content.try_lock() {
            Some(mut guard) if guard.is_some() => {
                *guard = None;
                true
            }
            _ => false,
        }
    }
}
