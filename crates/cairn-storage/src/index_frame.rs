//! B+tree page content.
//!
//! Body Layout:
//! ```text
//! +------+----------------+----------+-----------+
//! | leaf | last_child u64 | left u64 | right u64 |   25 bytes
//! +------+----------------+----------+-----------+
//! | key_len u16 | key | target u64 | pointer u16 |   one per entry
//! | ...                                          |
//! ```
//!
//! In a leaf the target is the row's locator. In a node the target frame is
//! a child holding keys `<=` the entry key; `last_child` holds the rest.

use bytes::{Buf, BufMut, Bytes};
use std::cmp::Ordering;

use cairn_common::prelude::*;

/// Fixed prefix of every index body
pub const INDEX_PREFIX_SIZE: usize = 25;

/// Per-entry overhead besides the key bytes
pub const INDEX_ENTRY_OVERHEAD: usize = 2 + 8 + 2;

/// One key chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Bytes,
    pub target: ChunkLocator,
}

impl IndexEntry {
    pub fn new(key: Bytes, target: ChunkLocator) -> Self {
        Self { key, target }
    }

    /// Separator entry pointing at a child frame
    pub fn child(key: Bytes, child: FrameId) -> Self {
        Self {
            key,
            target: ChunkLocator::new(child, 0),
        }
    }

    pub fn encoded_len(&self) -> usize {
        INDEX_ENTRY_OVERHEAD + self.key.len()
    }

    fn cmp_entry(&self, key: &[u8], target: &ChunkLocator) -> Ordering {
        self.key.as_ref().cmp(key).then_with(|| self.target.cmp(target))
    }
}

/// Result of splitting a page: the separator and the new lower sibling,
/// to be inserted into the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitChunk {
    pub separator: Bytes,
    pub sibling: FrameId,
}

/// B+tree node or leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFrame {
    leaf: bool,
    pub last_child: FrameId,
    pub left: FrameId,
    pub right: FrameId,
    entries: Vec<IndexEntry>,
}

impl IndexFrame {
    pub fn new(leaf: bool) -> Self {
        Self {
            leaf,
            last_child: FrameId::NONE,
            left: FrameId::NONE,
            right: FrameId::NONE,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn encoded_len(&self) -> usize {
        INDEX_PREFIX_SIZE + self.entries.iter().map(IndexEntry::encoded_len).sum::<usize>()
    }

    pub fn fits(&self, capacity: usize) -> bool {
        self.encoded_len() <= capacity
    }

    /// Largest key in the page
    pub fn max_key(&self) -> Option<&Bytes> {
        self.entries.last().map(|e| &e.key)
    }

    /// Position of the first entry with key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|e| e.key.as_ref() < key)
    }

    /// Child to descend into for `key`: the first entry whose separator is
    /// `>= key`, else the last child. Returns the entry index (`len()` for
    /// the last child) and the frame.
    pub fn child_for(&self, key: &[u8]) -> (usize, FrameId) {
        let pos = self.lower_bound(key);
        match self.entries.get(pos) {
            Some(entry) => (pos, entry.target.frame),
            None => (self.entries.len(), self.last_child),
        }
    }

    /// Every child frame, last child included.
    pub fn children(&self) -> Vec<FrameId> {
        let mut out: Vec<FrameId> = self.entries.iter().map(|e| e.target.frame).collect();
        if self.last_child.is_some() {
            out.push(self.last_child);
        }
        out
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries
            .get(self.lower_bound(key))
            .is_some_and(|e| e.key.as_ref() == key)
    }

    /// Insert a leaf entry in `(key, locator)` order. Returns false if the
    /// exact entry is already present.
    pub fn insert_sorted(&mut self, key: Bytes, target: ChunkLocator) -> bool {
        match self
            .entries
            .binary_search_by(|e| e.cmp_entry(&key, &target))
        {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, IndexEntry::new(key, target));
                true
            }
        }
    }

    /// Insert a separator for a new lower sibling in front of the entry at
    /// `pos` (the position of the child that split).
    pub fn insert_separator(&mut self, pos: usize, split: SplitChunk) {
        let pos = pos.min(self.entries.len());
        self.entries
            .insert(pos, IndexEntry::child(split.separator, split.sibling));
    }

    /// Remove the exact `(key, target)` entry.
    pub fn remove_entry(&mut self, key: &[u8], target: &ChunkLocator) -> bool {
        match self.entries.binary_search_by(|e| e.cmp_entry(key, target)) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Move the lower half of this page into a new page.
    ///
    /// Leaves hand over their first half and the separator is the largest key
    /// moved. Nodes hand over their first half too, but the last moved entry
    /// becomes the new page's last child and its key the separator.
    /// Sibling links are left to the caller.
    pub fn split(&mut self) -> Result<(IndexFrame, Bytes)> {
        if self.entries.len() < 2 {
            return Err(Error::consistency(format!(
                "cannot split an index page of {} entries",
                self.entries.len()
            )));
        }
        // Split by bytes so both halves fit even with uneven key sizes
        let half = self.entries.iter().map(IndexEntry::encoded_len).sum::<usize>() / 2;
        let mut mid = 0;
        let mut acc = 0;
        for entry in &self.entries {
            if acc + entry.encoded_len() > half {
                break;
            }
            acc += entry.encoded_len();
            mid += 1;
        }
        let mid = mid.clamp(1, self.entries.len() - 1);
        let upper = self.entries.split_off(mid);
        let mut lower = std::mem::replace(&mut self.entries, upper);

        let mut sibling = IndexFrame::new(self.leaf);
        let separator;
        if self.leaf {
            separator = lower
                .last()
                .map(|e| e.key.clone())
                .ok_or_else(|| Error::consistency("empty lower half after split"))?;
        } else {
            let promoted = lower
                .pop()
                .ok_or_else(|| Error::consistency("empty lower half after split"))?;
            sibling.last_child = promoted.target.frame;
            separator = promoted.key;
        }
        sibling.entries = lower;
        Ok((sibling, separator))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u8(self.leaf as u8);
        buf.put_u64_le(self.last_child.to_u64());
        buf.put_u64_le(self.left.to_u64());
        buf.put_u64_le(self.right.to_u64());
        for entry in &self.entries {
            buf.put_u16_le(entry.key.len() as u16);
            buf.put_slice(&entry.key);
            buf.put_u64_le(entry.target.frame.to_u64());
            buf.put_u16_le(entry.target.pointer);
        }
        buf
    }

    fn decode_prefix(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_PREFIX_SIZE {
            return Err(Error::consistency("index body too short"));
        }
        let mut buf = data;
        let leaf = buf.get_u8() != 0;
        let last_child = FrameId::from_u64(buf.get_u64_le());
        let left = FrameId::from_u64(buf.get_u64_le());
        let right = FrameId::from_u64(buf.get_u64_le());
        Ok(Self {
            leaf,
            last_child,
            left,
            right,
            entries: Vec::new(),
        })
    }

    /// Decode a body holding exactly `count` entries.
    pub fn decode(data: &[u8], count: usize) -> Result<Self> {
        let mut frame = Self::decode_prefix(data)?;
        let mut buf = &data[INDEX_PREFIX_SIZE..];
        frame.entries.reserve(count);
        for i in 0..count {
            if buf.remaining() < 2 {
                return Err(Error::consistency(format!("index entry {} truncated", i)));
            }
            let key_len = buf.get_u16_le() as usize;
            if buf.remaining() < key_len + 10 {
                return Err(Error::consistency(format!("index entry {} truncated", i)));
            }
            let key = Bytes::copy_from_slice(&buf[..key_len]);
            buf.advance(key_len);
            let frame_id = FrameId::from_u64(buf.get_u64_le());
            let pointer = buf.get_u16_le();
            frame
                .entries
                .push(IndexEntry::new(key, ChunkLocator::new(frame_id, pointer)));
        }
        Ok(frame)
    }
}
