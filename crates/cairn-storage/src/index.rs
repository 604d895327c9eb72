//! B+tree operations of index tables.
//!
//! Pages are frames of the index table. A node entry `(separator, child)`
//! covers keys up to and including the separator; `last_child` covers the
//! rest. Splits move the lower half of a page into a new sibling, so the
//! page the parent already points to keeps its position. Leaves are linked
//! left and right for ordered walks. Pages are never merged.

use std::sync::Arc;

use cairn_common::prelude::*;

use crate::engine::StorageEngine;
use crate::frame::{frame_flags, Frame, FrameData, FrameKind};
use crate::index_frame::{IndexFrame, SplitChunk, INDEX_ENTRY_OVERHEAD, INDEX_PREFIX_SIZE};
use crate::llt::Llt;
use crate::table::{Table, TableKind};
use crate::{UndoImage, WriteTracker};

/// Deeper trees mean a corrupted child link
const MAX_DEPTH: usize = 32;

/// Result of [`Table::verify_tree`]
#[derive(Debug, Clone, Default)]
pub struct TreeReport {
    pub depth: usize,
    pub pages: usize,
    pub leaves: usize,
    pub entries: usize,
    pub problems: Vec<String>,
}

impl TreeReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

type DescentPath = Vec<(Arc<FrameData>, usize)>;

impl Table {
    fn ensure_index(&self) -> Result<bool> {
        match self.kind() {
            TableKind::Index { unique } => Ok(unique),
            _ => Err(Error::invalid_argument(format!("{} is not an index table", self.name()))),
        }
    }

    /// Longest key that still leaves room for four entries per page.
    pub fn max_key_len(&self) -> usize {
        ((self.capacity() - INDEX_PREFIX_SIZE) / 4).saturating_sub(INDEX_ENTRY_OVERHEAD)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_len() {
            return Err(Error::invalid_argument(format!(
                "key of {} bytes exceeds {} bytes allowed by {}",
                key.len(),
                self.max_key_len(),
                self.name()
            )));
        }
        Ok(())
    }

    fn read_page(&self, engine: &StorageEngine, frame: &FrameData) -> Result<IndexFrame> {
        Ok(engine.load(frame)?.as_index()?.clone())
    }

    fn write_page(&self, engine: &StorageEngine, frame: &FrameData, page: IndexFrame) -> Result<()> {
        let mut content = engine.load(frame)?;
        *content = Frame::Index(page);
        engine.write_frame(frame, &content)
    }

    fn new_page(&self, engine: &StorageEngine, kind: FrameKind, llt: &mut Llt) -> Result<Arc<FrameData>> {
        let file = self.next_tree_file();
        let mut chain = self.chain.lock();
        self.append_frame(engine, &mut chain, file, kind, llt)
    }

    fn root_page(&self, engine: &StorageEngine) -> Result<Option<Arc<FrameData>>> {
        let root = self.chain.lock().root;
        root.link().map(|id| engine.frame(id)).transpose()
    }

    fn ensure_root(&self, engine: &StorageEngine, llt: &mut Llt) -> Result<Arc<FrameData>> {
        if let Some(root) = self.root_page(engine)? {
            return Ok(root);
        }
        let leaf = self.new_page(engine, FrameKind::IndexLeaf, llt)?;
        leaf.update_header(|h| h.set_flag(frame_flags::ROOT, true));
        self.chain.lock().root = leaf.id();
        debug!(index = %self.name(), root = %leaf.id(), "created index root");
        Ok(leaf)
    }

    /// Walk from `root` to the leaf covering `key`, recording each node and
    /// the entry index taken when `path` is given.
    fn descend(
        &self,
        engine: &StorageEngine,
        root: Arc<FrameData>,
        key: &[u8],
        mut path: Option<&mut DescentPath>,
    ) -> Result<Arc<FrameData>> {
        let mut frame = root;
        for _ in 0..MAX_DEPTH {
            let step = {
                let content = engine.load(&frame)?;
                let page = content.as_index()?;
                if page.is_leaf() {
                    None
                } else {
                    Some(page.child_for(key))
                }
            };
            let Some((pos, child)) = step else {
                return Ok(frame);
            };
            if child.is_none() {
                return Err(Error::consistency(format!(
                    "index node {} of {} has no child for position {}",
                    frame.id(),
                    self.name(),
                    pos
                )));
            }
            let next = engine.frame(child)?;
            if let Some(path) = path.as_deref_mut() {
                path.push((frame, pos));
            }
            frame = next;
        }
        Err(Error::consistency(format!("{} is deeper than {} levels", self.name(), MAX_DEPTH)))
    }

    fn leftmost_leaf(&self, engine: &StorageEngine, root: Arc<FrameData>) -> Result<Arc<FrameData>> {
        let mut frame = root;
        for _ in 0..MAX_DEPTH {
            let child = {
                let content = engine.load(&frame)?;
                let page = content.as_index()?;
                if page.is_leaf() {
                    return Ok(Arc::clone(&frame));
                }
                page.children().first().copied().unwrap_or(FrameId::NONE)
            };
            frame = engine.frame(child)?;
        }
        Err(Error::consistency(format!("{} is deeper than {} levels", self.name(), MAX_DEPTH)))
    }

    /// Write `page` back, splitting it first if it overflows.
    fn store_page(
        &self,
        engine: &StorageEngine,
        frame: &Arc<FrameData>,
        page: IndexFrame,
        llt: &mut Llt,
    ) -> Result<Option<SplitChunk>> {
        if page.fits(self.capacity()) {
            self.write_page(engine, frame, page)?;
            return Ok(None);
        }
        self.split_page(engine, frame, page, llt).map(Some)
    }

    fn split_page(
        &self,
        engine: &StorageEngine,
        frame: &Arc<FrameData>,
        mut page: IndexFrame,
        llt: &mut Llt,
    ) -> Result<SplitChunk> {
        let (mut lower, separator) = page.split()?;
        let kind = if page.is_leaf() {
            FrameKind::IndexLeaf
        } else {
            FrameKind::IndexNode
        };
        let sibling = self.new_page(engine, kind, llt)?;

        if page.is_leaf() {
            lower.left = page.left;
            lower.right = frame.id();
            if let Some(left_id) = page.left.link() {
                let left = engine.frame(left_id)?;
                let mut left_page = self.read_page(engine, &left)?;
                left_page.right = sibling.id();
                self.write_page(engine, &left, left_page)?;
            }
            page.left = sibling.id();
        }
        if !lower.fits(self.capacity()) || !page.fits(self.capacity()) {
            return Err(Error::consistency(format!(
                "split of {} left a page over capacity",
                frame.id()
            )));
        }

        self.write_page(engine, &sibling, lower)?;
        self.write_page(engine, frame, page)?;
        debug!(index = %self.name(), page = %frame.id(), sibling = %sibling.id(), "split index page");
        Ok(SplitChunk {
            separator,
            sibling: sibling.id(),
        })
    }

    /// Put a new node above the split root.
    fn grow_root(
        &self,
        engine: &StorageEngine,
        old_root: &Arc<FrameData>,
        split: SplitChunk,
        llt: &mut Llt,
    ) -> Result<()> {
        let root = self.new_page(engine, FrameKind::IndexNode, llt)?;
        let mut node = IndexFrame::new(false);
        node.insert_separator(0, split);
        node.last_child = old_root.id();

        root.update_header(|h| h.set_flag(frame_flags::ROOT, true));
        old_root.update_header(|h| h.set_flag(frame_flags::ROOT, false));
        self.write_page(engine, &root, node)?;
        llt.add(old_root);
        llt.add(&root);
        self.chain.lock().root = root.id();
        debug!(index = %self.name(), root = %root.id(), "index grew a level");
        Ok(())
    }

    /// Add `(key, row)` to the index. Unique indexes reject a key that is
    /// already present.
    pub fn insert_key(
        &self,
        engine: &StorageEngine,
        key: Bytes,
        row: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<()> {
        let unique = self.ensure_index()?;
        self.check_key(&key)?;
        let tracker = self.tracker(tracker);
        let _tree = self.tree_lock.lock();

        let mut llt = Llt::new();
        let root = self.ensure_root(engine, &mut llt)?;
        let mut path = DescentPath::new();
        let leaf = self.descend(engine, root, &key, Some(&mut path))?;

        let mut page = self.read_page(engine, &leaf)?;
        if unique && page.contains_key(&key) {
            llt.flush(engine)?;
            return Err(Error::Storage(StorageError::DuplicateKey(self.name().to_string())));
        }
        if !page.insert_sorted(key.clone(), row) {
            llt.flush(engine)?;
            return Ok(());
        }

        let mut pending = self.store_page(engine, &leaf, page, &mut llt)?;
        let mut child = Arc::clone(&leaf);
        while let Some(split) = pending.take() {
            match path.pop() {
                Some((parent, pos)) => {
                    let mut node = self.read_page(engine, &parent)?;
                    node.insert_separator(pos, split);
                    pending = self.store_page(engine, &parent, node, &mut llt)?;
                    child = parent;
                }
                None => self.grow_root(engine, &child, split, &mut llt)?,
            }
        }
        llt.flush(engine)?;

        if let Some(t) = tracker {
            t.lock_chunk(engine, self, &leaf, row, UndoImage::IndexInsert { key, row })?;
        }
        Ok(())
    }

    /// Remove the exact `(key, row)` entry. Returns false if it is absent.
    pub fn remove_key(
        &self,
        engine: &StorageEngine,
        key: &[u8],
        row: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<bool> {
        self.ensure_index()?;
        let tracker = self.tracker(tracker);
        let _tree = self.tree_lock.lock();

        let Some(root) = self.root_page(engine)? else {
            return Ok(false);
        };
        let mut leaf = self.descend(engine, root, key, None)?;
        loop {
            let mut page = self.read_page(engine, &leaf)?;
            if page.remove_entry(key, &row) {
                self.write_page(engine, &leaf, page)?;
                if let Some(t) = tracker {
                    t.lock_chunk(
                        engine,
                        self,
                        &leaf,
                        row,
                        UndoImage::IndexRemove {
                            key: Bytes::copy_from_slice(key),
                            row,
                        },
                    )?;
                }
                return Ok(true);
            }
            if page.max_key().is_some_and(|max| max.as_ref() > key) {
                return Ok(false);
            }
            match page.right.link() {
                Some(right) => leaf = engine.frame(right)?,
                None => return Ok(false),
            }
        }
    }

    /// Every row stored under `key`.
    pub fn get_objects_by_key(&self, engine: &StorageEngine, key: &[u8]) -> Result<Vec<ChunkLocator>> {
        self.ensure_index()?;
        let _tree = self.tree_lock.lock();
        let Some(root) = self.root_page(engine)? else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        let mut leaf = self.descend(engine, root, key, None)?;
        loop {
            let page = self.read_page(engine, &leaf)?;
            found.extend(
                page.entries()
                    .iter()
                    .filter(|e| e.key.as_ref() == key)
                    .map(|e| e.target),
            );
            if page.max_key().is_some_and(|max| max.as_ref() > key) {
                return Ok(found);
            }
            match page.right.link() {
                Some(right) => leaf = engine.frame(right)?,
                None => return Ok(found),
            }
        }
    }

    /// The row stored under `key`, if any.
    pub fn get_object_by_key(&self, engine: &StorageEngine, key: &[u8]) -> Result<Option<ChunkLocator>> {
        Ok(self.get_objects_by_key(engine, key)?.into_iter().next())
    }

    /// All entries in key order, walking the leaf level.
    pub fn index_entries(&self, engine: &StorageEngine) -> Result<Vec<(Bytes, ChunkLocator)>> {
        self.ensure_index()?;
        let _tree = self.tree_lock.lock();
        let Some(root) = self.root_page(engine)? else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let mut cursor = self.leftmost_leaf(engine, root)?.id();
        while let Some(id) = cursor.link() {
            let frame = engine.frame(id)?;
            let page = self.read_page(engine, &frame)?;
            out.extend(page.entries().iter().map(|e| (e.key.clone(), e.target)));
            cursor = page.right;
        }
        Ok(out)
    }

    /// Check ordering, separator bounds, leaf depth and sibling links.
    pub fn verify_tree(&self, engine: &StorageEngine) -> Result<TreeReport> {
        let unique = self.ensure_index()?;
        let _tree = self.tree_lock.lock();
        let mut report = TreeReport::default();
        let Some(root) = self.root_page(engine)? else {
            return Ok(report);
        };
        if !root.is_root() {
            report.problems.push(format!("root {} lacks the root flag", root.id()));
        }

        let mut leaves = Vec::new();
        self.verify_page(engine, &root, None, None, 1, unique, &mut leaves, &mut report)?;

        for (i, (id, page)) in leaves.iter().enumerate() {
            let expected_left = if i == 0 { FrameId::NONE } else { leaves[i - 1].0 };
            let expected_right = leaves.get(i + 1).map(|l| l.0).unwrap_or(FrameId::NONE);
            if page.left != expected_left {
                report.problems.push(format!("leaf {} links left to {}, expected {}", id, page.left, expected_left));
            }
            if page.right != expected_right {
                report.problems.push(format!("leaf {} links right to {}, expected {}", id, page.right, expected_right));
            }
        }
        report.leaves = leaves.len();
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_page(
        &self,
        engine: &StorageEngine,
        frame: &Arc<FrameData>,
        low: Option<&Bytes>,
        high: Option<&Bytes>,
        level: usize,
        unique: bool,
        leaves: &mut Vec<(FrameId, IndexFrame)>,
        report: &mut TreeReport,
    ) -> Result<()> {
        if level > MAX_DEPTH {
            report.problems.push(format!("page {} below the depth limit", frame.id()));
            return Ok(());
        }
        let page = self.read_page(engine, frame)?;
        report.pages += 1;

        let expected_kind = if page.is_leaf() {
            FrameKind::IndexLeaf
        } else {
            FrameKind::IndexNode
        };
        if frame.kind() != expected_kind {
            report.problems.push(format!("page {} stored as {:?}", frame.id(), frame.kind()));
        }

        for pair in page.entries().windows(2) {
            let ordered = if unique && page.is_leaf() {
                pair[0].key < pair[1].key
            } else {
                pair[0].key <= pair[1].key
            };
            if !ordered {
                report.problems.push(format!("page {} keys out of order", frame.id()));
            }
        }
        for entry in page.entries() {
            if low.is_some_and(|low| entry.key < *low) || high.is_some_and(|high| entry.key > *high) {
                report.problems.push(format!("page {} holds a key outside its separators", frame.id()));
                break;
            }
        }

        if page.is_leaf() {
            if report.depth == 0 {
                report.depth = level;
            } else if report.depth != level {
                report.problems.push(format!("leaf {} at depth {}, expected {}", frame.id(), level, report.depth));
            }
            report.entries += page.len();
            leaves.push((frame.id(), page));
            return Ok(());
        }

        if page.last_child.is_none() {
            report.problems.push(format!("node {} has no last child", frame.id()));
        }
        let mut lower = low.cloned();
        for entry in page.entries() {
            let child = engine.frame(entry.target.frame)?;
            self.verify_page(engine, &child, lower.as_ref(), Some(&entry.key), level + 1, unique, leaves, report)?;
            lower = Some(entry.key.clone());
        }
        if let Some(last) = page.last_child.link() {
            let child = engine.frame(last)?;
            self.verify_page(engine, &child, lower.as_ref(), high, level + 1, unique, leaves, report)?;
        }
        Ok(())
    }
}
