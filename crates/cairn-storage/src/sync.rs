//! Frame replication records.
//!
//! A node ships whole frames to its peers. The receiver writes each frame at
//! the same file and pointer and registers it; a frame that starts a chain on
//! its source becomes a remote chain start of the receiving table, marked in
//! the header's `started` field.
//!
//! Record Layout:
//! ```text
//! +-----------+------------+------------+--------------+-------------+------+---------+
//! | magic u32 | source u32 | started u8 | header (64B) | body_len u32| body | crc u32 |
//! +-----------+------------+------------+--------------+-------------+------+---------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_common::utils::{crc32, verify_crc32};

use crate::engine::StorageEngine;
use crate::frame::{frame_flags, Frame, FrameData, FrameHeader, FRAME_HEADER_SIZE};

/// "CSYN"
pub const SYNC_MAGIC: u32 = 0x4353_594E;

const FIXED_SIZE: usize = 4 + 4 + 1 + FRAME_HEADER_SIZE + 4 + 4;

/// One frame on its way to another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSync {
    pub source: NodeId,
    pub header: FrameHeader,
    pub body: Bytes,
    /// The frame starts a chain on the source node
    pub started: bool,
}

impl FrameSync {
    /// Value stored in `started` for chains begun by `node`. Zero means the
    /// chain is local, so node ids are shifted by one.
    pub fn started_mark(node: NodeId) -> u32 {
        node.0.wrapping_add(1).max(1)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_SIZE + self.body.len());
        buf.put_u32_le(SYNC_MAGIC);
        buf.put_u32_le(self.source.0);
        buf.put_u8(self.started as u8);
        buf.put_slice(&self.header.encode());
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(&self.body);
        let crc = crc32(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_SIZE {
            return Err(Error::Serialization(format!(
                "frame sync record of {} bytes is truncated",
                data.len()
            )));
        }
        let (payload, tail) = data.split_at(data.len() - 4);
        let stored = (&tail[..]).get_u32_le();
        if !verify_crc32(payload, stored) {
            return Err(Error::Serialization("frame sync record checksum mismatch".to_string()));
        }

        let mut buf = payload;
        if buf.get_u32_le() != SYNC_MAGIC {
            return Err(Error::Serialization("bad frame sync magic".to_string()));
        }
        let source = NodeId(buf.get_u32_le());
        let started = buf.get_u8() != 0;
        let header = FrameHeader::decode(&buf[..FRAME_HEADER_SIZE])?;
        buf.advance(FRAME_HEADER_SIZE);
        let body_len = buf.get_u32_le() as usize;
        if buf.remaining() != body_len {
            return Err(Error::Serialization(format!(
                "frame sync body is {} bytes, record says {}",
                buf.remaining(),
                body_len
            )));
        }
        Ok(Self {
            source,
            header,
            body: Bytes::copy_from_slice(buf),
            started,
        })
    }
}

impl StorageEngine {
    /// Snapshot a frame for shipping.
    pub fn frame_sync(&self, frame: FrameId) -> Result<FrameSync> {
        let frame = self.frame(frame)?;
        let content = self.load(&frame)?;
        let header = frame.header();
        Ok(FrameSync {
            source: self.node_id(),
            header,
            body: Bytes::from(content.encode_body(frame.capacity())),
            started: header.prev.is_none(),
        })
    }

    /// Install a frame received from another node.
    pub fn apply_sync(&self, sync: &FrameSync) -> Result<Arc<FrameData>> {
        let id = sync.header.id;
        if sync.body.len() + FRAME_HEADER_SIZE != sync.header.size as usize {
            return Err(Error::invalid_argument(format!(
                "frame {} of {} bytes arrived with a {} byte body",
                id,
                sync.header.size,
                sync.body.len()
            )));
        }

        let mut header = sync.header;
        header.set_flag(frame_flags::CURRENT, false);
        header.set_flag(frame_flags::ALLOCATED, true);
        if sync.started {
            header.started = FrameSync::started_mark(sync.source);
        }
        let content = Frame::decode(&header, &sync.body)?;

        while self.file(id.file).is_err() {
            let created = self.create_file()?;
            if created.id().0 > id.file.0 {
                return Err(Error::invalid_argument(format!("no data file {} for frame {}", id.file.0, id)));
            }
        }
        self.file(id.file)?.reserve(id.pointer, header.size)?;
        self.free_list().remove(id);
        self.observe_alloc_id(header.alloc_id);

        let frame = match self.try_frame(id) {
            Some(existing) if existing.alloc_id() == header.alloc_id => {
                existing.update_header(|h| *h = header);
                let mut current = self.load(&existing)?;
                *current = content;
                self.write_frame(&existing, &current)?;
                drop(current);
                trace!(frame = %id, source = sync.source.0, "refreshed synced frame");
                return Ok(existing);
            }
            _ => Arc::new(FrameData::with_content(header, content)),
        };
        {
            let current = self.load(&frame)?;
            self.write_frame(&frame, &current)?;
        }
        self.register_frame(Arc::clone(&frame));

        match self.table(header.object_id) {
            Ok(table) => table.adopt_remote(&frame, sync.started),
            Err(_) => self.defer_frame(header.object_id, Arc::clone(&frame)),
        }
        debug!(frame = %id, source = sync.source.0, started = sync.started, "applied synced frame");
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableOptions;
    use cairn_common::testing::{fixtures, TestContext};

    fn node(ctx: &TestContext, id: u32) -> StorageEngine {
        let mut config = ctx.small_config();
        config.node_id = id;
        StorageEngine::open(config).unwrap()
    }

    #[test]
    fn test_record_rejects_tampering() {
        let ctx = TestContext::new();
        let engine = node(&ctx, 1);
        let table = engine
            .create_table(TableOptions::data(ObjectId(10), "rows").non_transactional())
            .unwrap();
        let locator = table.persist(&engine, &fixtures::row(1, 16), None).unwrap();

        let record = engine.frame_sync(locator.frame).unwrap();
        assert!(record.started);
        let bytes = record.encode();
        assert_eq!(FrameSync::decode(&bytes).unwrap(), record);

        let mut flipped = bytes.to_vec();
        flipped[80] ^= 0x01;
        assert!(FrameSync::decode(&flipped).is_err());
        assert!(FrameSync::decode(&bytes[..20]).is_err());
    }

    #[test]
    fn test_applied_frame_joins_remote_chain() {
        let source_ctx = TestContext::new();
        let target_ctx = TestContext::new();
        let source = node(&source_ctx, 1);
        let target = node(&target_ctx, 2);

        let rows = source
            .create_table(TableOptions::data(ObjectId(10), "rows").non_transactional())
            .unwrap();
        for row in fixtures::rows(3, 16) {
            rows.persist(&source, &row, None).unwrap();
        }
        let replica = target
            .create_table(TableOptions::data(ObjectId(10), "rows").non_transactional())
            .unwrap();

        let record = FrameSync::decode(&source.frame_sync(rows.chain().head).unwrap().encode()).unwrap();
        let frame = target.apply_sync(&record).unwrap();
        assert_eq!(frame.started(), FrameSync::started_mark(NodeId(1)));
        assert!(!frame.is_current());

        let chain = replica.chain();
        assert_eq!(chain.remote_starts, vec![frame.id()]);
        assert!(chain.head.is_none());
        assert_eq!(replica.scan(&target).unwrap().len(), 3);
        assert!(replica.verify_chain(&target).unwrap().is_ok());

        // Local appends go past the synced frame
        let local = replica.persist(&target, &fixtures::row(9, 16), None).unwrap();
        assert!(local.frame.pointer > frame.id().pointer);
    }

    #[test]
    fn test_synced_frames_claimed_after_reopen() {
        let source_ctx = TestContext::new();
        let target_ctx = TestContext::new();
        let source = node(&source_ctx, 1);
        let rows = source
            .create_table(TableOptions::data(ObjectId(10), "rows").non_transactional())
            .unwrap();
        rows.persist(&source, &fixtures::row(1, 16), None).unwrap();
        let record = source.frame_sync(rows.chain().head).unwrap();

        {
            let target = node(&target_ctx, 2);
            target.apply_sync(&record).unwrap();
            assert_eq!(target.unclaimed_objects(), vec![ObjectId(10)]);
        }
        let target = node(&target_ctx, 2);
        let replica = target
            .create_table(TableOptions::data(ObjectId(10), "rows").non_transactional())
            .unwrap();
        assert_eq!(replica.chain().remote_starts.len(), 1);
        assert_eq!(replica.scan(&target).unwrap().len(), 1);
    }
}
