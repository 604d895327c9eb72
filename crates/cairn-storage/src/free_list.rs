//! Free-frame list keyed by (file, size).
//!
//! A freed frame may still be named by a transaction that touched it, so it
//! enters the list unpassed and is promoted once nothing references its old
//! id. Only passed entries are handed out.

use dashmap::DashMap;
use parking_lot::Mutex;

use cairn_common::prelude::*;

/// A frame whose space can be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeFrame {
    pub frame: FrameId,
    pub object_id: ObjectId,
    pub size: u32,
    /// Safe to hand out
    pub passed: bool,
}

impl FreeFrame {
    pub fn file(&self) -> FileId {
        self.frame.file
    }
}

/// Per-file buckets of free frames
#[derive(Debug, Default)]
pub struct FreeList {
    buckets: DashMap<FileId, Mutex<Vec<FreeFrame>>>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freed frame. A frame already in the list is not added twice.
    pub fn insert(&self, entry: FreeFrame) -> bool {
        let bucket = self.buckets.entry(entry.file()).or_default();
        let mut frames = bucket.lock();
        if frames.iter().any(|f| f.frame == entry.frame) {
            return false;
        }
        frames.push(entry);
        true
    }

    /// Take a passed frame of exactly `size` bytes in `file`.
    ///
    /// Unpassed entries are promoted first when `referenced` reports that
    /// nothing still names them.
    pub fn take(&self, file: FileId, size: u32, referenced: impl Fn(FrameId) -> bool) -> Option<FreeFrame> {
        let bucket = self.buckets.get(&file)?;
        let mut frames = bucket.lock();
        for entry in frames.iter_mut().filter(|f| !f.passed) {
            if !referenced(entry.frame) {
                entry.passed = true;
            }
        }
        let pos = frames.iter().position(|f| f.passed && f.size == size)?;
        Some(frames.swap_remove(pos))
    }

    /// Promote an unpassed entry once its old id is no longer referenced.
    pub fn pass(&self, frame: FrameId) -> bool {
        let Some(bucket) = self.buckets.get(&frame.file) else {
            return false;
        };
        let mut frames = bucket.lock();
        match frames.iter_mut().find(|f| f.frame == frame && !f.passed) {
            Some(entry) => {
                entry.passed = true;
                true
            }
            None => false,
        }
    }

    /// Drop an entry without handing it out.
    pub fn remove(&self, frame: FrameId) -> Option<FreeFrame> {
        let bucket = self.buckets.get(&frame.file)?;
        let mut frames = bucket.lock();
        let pos = frames.iter().position(|f| f.frame == frame)?;
        Some(frames.swap_remove(pos))
    }

    pub fn contains(&self, frame: FrameId) -> bool {
        self.get(frame).is_some()
    }

    pub fn get(&self, frame: FrameId) -> Option<FreeFrame> {
        self.buckets
            .get(&frame.file)
            .and_then(|bucket| bucket.lock().iter().find(|f| f.frame == frame).copied())
    }

    /// Entries of one file, in no particular order.
    pub fn entries(&self, file: FileId) -> Vec<FreeFrame> {
        self.buckets
            .get(&file)
            .map(|bucket| bucket.lock().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free(file: u32, pointer: u64, size: u32, passed: bool) -> FreeFrame {
        FreeFrame {
            frame: FrameId::new(FileId(file), pointer),
            object_id: ObjectId(1),
            size,
            passed,
        }
    }

    #[test]
    fn test_take_exact_size() {
        let list = FreeList::new();
        list.insert(free(1, 64, 256, true));
        list.insert(free(1, 320, 512, true));

        assert!(list.take(FileId(1), 1024, |_| false).is_none());
        let taken = list.take(FileId(1), 512, |_| false).unwrap();
        assert_eq!(taken.frame.pointer, 320);
        assert_eq!(list.len(), 1);
        assert!(list.take(FileId(2), 256, |_| false).is_none());
    }

    #[test]
    fn test_unpassed_entries_wait_for_references() {
        let list = FreeList::new();
        list.insert(free(1, 64, 256, false));

        assert!(list.take(FileId(1), 256, |_| true).is_none());
        assert!(!list.get(FrameId::new(FileId(1), 64)).unwrap().passed);

        let taken = list.take(FileId(1), 256, |_| false).unwrap();
        assert!(taken.passed);
        assert!(list.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let list = FreeList::new();
        assert!(list.insert(free(3, 64, 256, true)));
        assert!(!list.insert(free(3, 64, 256, true)));
        assert_eq!(list.entries(FileId(3)).len(), 1);
        assert!(list.remove(FrameId::new(FileId(3), 64)).is_some());
        assert!(!list.contains(FrameId::new(FileId(3), 64)));
    }
}
