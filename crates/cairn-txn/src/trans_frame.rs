//! Per-transaction record of a touched frame.

use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_storage::{FrameData, FrameKind};

use crate::undo::UndoRef;

/// A frame a transaction changed.
///
/// The transaction holds one engine reference per TransFrame and, once an
/// undo frame is attached, one `tcounter` on the frame itself.
#[derive(Debug)]
pub struct TransFrame {
    pub frame: Arc<FrameData>,
    pub table: ObjectId,
    pub kind: FrameKind,
    /// First undo frame holding pre-images of this frame
    pub undo: Option<FrameId>,
    /// Pending change to `used`, applied at commit
    pub delta: i64,
    /// Undo chunks saved for this frame, as (creation key, location)
    pub undo_chunks: Vec<(u64, UndoRef)>,
}

impl TransFrame {
    pub fn new(frame: Arc<FrameData>) -> Self {
        let table = frame.object_id();
        let kind = frame.kind();
        Self {
            frame,
            table,
            kind,
            undo: None,
            delta: 0,
            undo_chunks: Vec::new(),
        }
    }

    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn is_index(&self) -> bool {
        matches!(self.kind, FrameKind::IndexLeaf | FrameKind::IndexNode)
    }

    /// Fold in another change. Returns true when this is the first undo
    /// frame attached, meaning the caller must retain the frame's tcounter.
    pub fn merge(&mut self, undo: Option<FrameId>, delta: i64) -> bool {
        self.delta += delta;
        match (self.undo, undo) {
            (None, Some(undo)) => {
                self.undo = Some(undo);
                true
            }
            _ => false,
        }
    }
}
