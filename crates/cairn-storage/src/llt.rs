//! LLT: frames whose headers are flushed together.
//!
//! A structural operation (chain relink, tree split, allocation, free) adds
//! every frame it touches and flushes once at the end. The flush goes
//! through the header journal, so after a crash either every header of the
//! batch is on disk or none is.

use std::collections::HashSet;
use std::sync::Arc;

use cairn_common::prelude::*;

use crate::engine::StorageEngine;
use crate::frame::FrameData;

#[derive(Debug, Default)]
pub struct Llt {
    frames: Vec<Arc<FrameData>>,
    seen: HashSet<FrameId>,
    flushed: bool,
}

impl Llt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame; returns false if it is already in the batch.
    pub fn add(&mut self, frame: &Arc<FrameData>) -> bool {
        if !self.seen.insert(frame.id()) {
            return false;
        }
        self.frames.push(Arc::clone(frame));
        true
    }

    pub fn contains(&self, frame: FrameId) -> bool {
        self.seen.contains(&frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Arc<FrameData>] {
        &self.frames
    }

    /// Write every header of the batch as one durability unit.
    pub fn flush(mut self, engine: &StorageEngine) -> Result<()> {
        engine.flush_headers(&self.frames)?;
        self.flushed = true;
        Ok(())
    }
}

impl Drop for Llt {
    fn drop(&mut self) {
        if !self.flushed && !self.frames.is_empty() {
            let frames: Vec<String> = self.frames.iter().map(|f| f.id().to_string()).collect();
            warn!(frames = ?frames, "LLT dropped without flushing its headers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, FrameKind};

    fn frame(pointer: u64) -> Arc<FrameData> {
        Arc::new(FrameData::new(FrameHeader::new(
            FrameId::new(FileId(1), pointer),
            ObjectId(1),
            FrameKind::Data,
            256,
            AllocId(1),
        )))
    }

    #[test]
    fn test_add_deduplicates() {
        let mut llt = Llt::new();
        let a = frame(64);
        assert!(llt.add(&a));
        assert!(!llt.add(&a));
        assert!(llt.add(&frame(320)));
        assert_eq!(llt.len(), 2);
        assert!(llt.contains(FrameId::new(FileId(1), 64)));
    }

    #[test]
    fn test_empty_llt_drops_quietly() {
        let llt = Llt::new();
        assert!(llt.is_empty());
        drop(llt);
    }
}
