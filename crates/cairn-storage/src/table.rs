//! Tables: doubly-linked chains of frames owned by one object id.
//!
//! Rows are appended to the current frame of a partition slot. A frame that
//! fills up is replaced by a fresh frame linked at the tail; a frame whose
//! last chunk is removed is unlinked and returned to the free list once no
//! transaction still holds it. Chain structure only changes under the chain
//! lock and every structural change is flushed as one LLT.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cairn_common::prelude::*;

use crate::chunk::{Chunk, KeyExtractor};
use crate::data_frame::CHUNK_HEADER_SIZE;
use crate::engine::StorageEngine;
use crate::frame::{frame_flags, Frame, FrameData, FrameKind, FRAME_HEADER_SIZE};
use crate::llt::Llt;
use crate::wait_frame::{WaitFrames, WaitGuard};
use crate::{UndoImage, WriteTracker};

/// What a table stores and whether its changes are transactional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// User rows; non-transactional tables apply changes immediately
    Data { transactional: bool },
    /// Engine metadata, never transactional
    System,
    /// B+tree pages of a secondary index
    Index { unique: bool },
}

impl TableKind {
    pub fn is_index(&self) -> bool {
        matches!(self, TableKind::Index { .. })
    }
}

/// Options for [`StorageEngine::create_table`]
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub object_id: ObjectId,
    pub name: String,
    pub kind: TableKind,
    /// Defaults to the engine's frame size
    pub frame_size: Option<u32>,
    /// Defaults to the engine's partition files
    pub partitions: Vec<FileId>,
}

impl TableOptions {
    pub fn data(object_id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            object_id,
            name: name.into(),
            kind: TableKind::Data { transactional: true },
            frame_size: None,
            partitions: Vec::new(),
        }
    }

    pub fn system(object_id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            kind: TableKind::System,
            ..Self::data(object_id, name)
        }
    }

    pub fn index(object_id: ObjectId, name: impl Into<String>, unique: bool) -> Self {
        Self {
            kind: TableKind::Index { unique },
            ..Self::data(object_id, name)
        }
    }

    pub fn non_transactional(mut self) -> Self {
        if let TableKind::Data { .. } = self.kind {
            self.kind = TableKind::Data { transactional: false };
        }
        self
    }

    pub fn with_frame_size(mut self, frame_size: u32) -> Self {
        self.frame_size = Some(frame_size);
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<FileId>) -> Self {
        self.partitions = partitions;
        self
    }
}

/// Chain structure of a table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    pub head: FrameId,
    pub tail: FrameId,
    /// Frames in the primary chain and every remote chain
    pub count: usize,
    /// First frames of chains received from other nodes
    pub remote_starts: Vec<FrameId>,
    /// Root page of an index table
    pub root: FrameId,
}

/// Result of [`Table::verify_chain`]
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    pub frames: usize,
    pub used_bytes: u64,
    pub problems: Vec<String>,
}

impl ChainReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Outcome of one append attempt against a slot's current frame
enum Append {
    Done(ChunkLocator),
    Full,
    Gone,
}

struct IndexBinding {
    index: Arc<Table>,
    extractor: Arc<dyn KeyExtractor>,
}

struct MemoryIndex {
    extractor: Arc<dyn KeyExtractor>,
    entries: BTreeMap<Bytes, Vec<ChunkLocator>>,
}

/// A table and its frame chain
pub struct Table {
    id: ObjectId,
    name: String,
    kind: TableKind,
    frame_size: u32,
    partitions: Vec<FileId>,
    pub(crate) chain: Mutex<Chain>,
    slots: WaitFrames,
    /// Serializes B+tree operations of an index table
    pub(crate) tree_lock: Mutex<()>,
    tree_cursor: AtomicUsize,
    indexes: RwLock<Vec<IndexBinding>>,
    memory_indexes: RwLock<HashMap<String, MemoryIndex>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("frame_size", &self.frame_size)
            .field("chain", &*self.chain.lock())
            .finish()
    }
}

fn deleted(locator: ChunkLocator) -> Error {
    Error::Storage(StorageError::DeletedRecord(locator.to_string()))
}

impl Table {
    pub(crate) fn new(
        options: &TableOptions,
        frame_size: u32,
        partitions: Vec<FileId>,
        wait: &WaitConfig,
    ) -> Self {
        Self {
            id: options.object_id,
            name: options.name.clone(),
            kind: options.kind,
            frame_size,
            slots: WaitFrames::new(partitions.len(), wait),
            partitions,
            chain: Mutex::new(Chain::default()),
            tree_lock: Mutex::new(()),
            tree_cursor: AtomicUsize::new(0),
            indexes: RwLock::new(Vec::new()),
            memory_indexes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Body bytes of one frame
    pub fn capacity(&self) -> usize {
        self.frame_size as usize - FRAME_HEADER_SIZE
    }

    pub fn partitions(&self) -> &[FileId] {
        &self.partitions
    }

    pub fn is_transactional(&self) -> bool {
        matches!(
            self.kind,
            TableKind::Data { transactional: true } | TableKind::Index { .. }
        )
    }

    pub fn chain(&self) -> Chain {
        self.chain.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.chain.lock().count
    }

    pub fn slots(&self) -> &WaitFrames {
        &self.slots
    }

    /// The tracker changes report to; non-transactional tables ignore it.
    pub(crate) fn tracker<'t>(
        &self,
        tracker: Option<&'t dyn WriteTracker>,
    ) -> Option<&'t dyn WriteTracker> {
        if self.is_transactional() {
            tracker
        } else {
            None
        }
    }

    fn ensure_rows(&self) -> Result<()> {
        if self.kind.is_index() {
            return Err(Error::invalid_argument(format!(
                "{} is an index table and holds no rows",
                self.name
            )));
        }
        Ok(())
    }

    /// The frame named by `id`, which must belong to this table.
    pub fn frame_of(&self, engine: &StorageEngine, id: FrameId) -> Result<Arc<FrameData>> {
        let frame = engine.frame(id)?;
        let owner = frame.object_id();
        if owner != self.id {
            return Err(Error::consistency(format!(
                "frame {} belongs to object {}, not {} ({})",
                id, owner.0, self.id.0, self.name
            )));
        }
        Ok(frame)
    }

    // ---------------------------------------------------------------------
    // Chain structure
    // ---------------------------------------------------------------------

    /// Allocate a frame and link it at the tail. Caller holds the chain lock
    /// and flushes `llt`.
    pub(crate) fn append_frame(
        &self,
        engine: &StorageEngine,
        chain: &mut Chain,
        file: FileId,
        kind: FrameKind,
        llt: &mut Llt,
    ) -> Result<Arc<FrameData>> {
        let frame = engine.allocate_frame(file, self.frame_size, self.id, kind)?;
        match chain.tail.link() {
            Some(tail_id) => {
                let tail = engine.frame(tail_id)?;
                tail.update_header(|h| h.next = frame.id());
                frame.update_header(|h| h.prev = tail_id);
                llt.add(&tail);
            }
            None => chain.head = frame.id(),
        }
        chain.tail = frame.id();
        chain.count += 1;
        llt.add(&frame);
        Ok(frame)
    }

    /// Allocate a data frame, link it at the tail and make it the current
    /// frame of `slot`. The frame it replaces is reclaimed if its rows are
    /// all gone; a frame that never held a row stays linked.
    pub fn create_new_frame(&self, engine: &StorageEngine, slot: usize) -> Result<Arc<FrameData>> {
        let (frame, evicted) = {
            let mut chain = self.chain.lock();
            self.install_new_frame(engine, &mut chain, slot)?
        };
        if let Some(old) = evicted {
            self.reclaim_evicted(engine, &old)?;
        }
        Ok(frame)
    }

    /// The current frame of `slot`, unless it is `full` or no longer
    /// allocated, in which case a new frame replaces it. Decided under the
    /// chain lock so writers sharing a slot after a forced takeover settle
    /// on the same frame.
    fn frame_after(&self, engine: &StorageEngine, slot: usize, full: Option<FrameId>) -> Result<Arc<FrameData>> {
        let (frame, evicted) = {
            let mut chain = self.chain.lock();
            if let Some(current) = self.slots.slot(slot).current() {
                if Some(current.id()) != full && current.is_allocated() {
                    return Ok(current);
                }
            }
            self.install_new_frame(engine, &mut chain, slot)?
        };
        if let Some(old) = evicted {
            self.reclaim_evicted(engine, &old)?;
        }
        Ok(frame)
    }

    fn install_new_frame(
        &self,
        engine: &StorageEngine,
        chain: &mut Chain,
        slot: usize,
    ) -> Result<(Arc<FrameData>, Option<Arc<FrameData>>)> {
        let file = self.partitions[slot % self.partitions.len()];
        let mut llt = Llt::new();
        let frame = self.append_frame(engine, chain, file, FrameKind::Data, &mut llt)?;
        let evicted = self.slots.slot(slot).install(Arc::clone(&frame));
        if let Some(old) = &evicted {
            debug!(table = %self.name, slot, old = %old.id(), new = %frame.id(), "current frame replaced");
            llt.add(old);
        }
        llt.flush(engine)?;
        Ok((frame, evicted))
    }

    fn reclaim_evicted(&self, engine: &StorageEngine, frame: &Arc<FrameData>) -> Result<()> {
        if frame.header().chunk_count == 0 {
            // Another writer may still be about to append to it
            return Ok(());
        }
        self.try_reclaim(engine, frame)?;
        Ok(())
    }

    /// Every frame of the table: the primary chain from its head, then each
    /// remote chain.
    pub fn frames(&self, engine: &StorageEngine) -> Result<VecDeque<Arc<FrameData>>> {
        let chain = self.chain();
        let mut frames = VecDeque::with_capacity(chain.count);
        let mut seen = HashSet::new();
        for start in std::iter::once(chain.head).chain(chain.remote_starts.iter().copied()) {
            let mut cursor = start;
            while let Some(id) = cursor.link() {
                if !seen.insert(id) {
                    return Err(Error::consistency(format!(
                        "chain of {} loops back to frame {}",
                        self.name, id
                    )));
                }
                let frame = engine.frame(id)?;
                cursor = frame.next();
                frames.push_back(frame);
            }
        }
        Ok(frames)
    }

    /// Unlink an empty frame and return it to the free list.
    ///
    /// Returns false when the frame is already gone, still current, held by
    /// a transaction or not empty.
    pub fn free_frame(&self, engine: &StorageEngine, frame: &Arc<FrameData>) -> Result<bool> {
        let mut chain = self.chain.lock();
        let id = frame.id();
        if engine.try_frame(id).is_none() {
            debug!(table = %self.name, frame = %id, "frame already freed");
            return Ok(false);
        }
        if frame.object_id() != self.id {
            return Err(Error::consistency(format!(
                "{} asked to free frame {} of object {}",
                self.name,
                id,
                frame.object_id().0
            )));
        }
        if frame.is_current() || frame.tcounter() > 0 {
            return Ok(false);
        }
        // Held until the frame is unallocated so no append can slip in
        let content = engine.load(frame)?;
        if !matches!(&*content, Frame::Data(data) if !data.has_chunks()) {
            return Ok(false);
        }

        let header = frame.header();
        let mut llt = Llt::new();
        let prev = header.prev.link().and_then(|p| engine.try_frame(p));
        let next = header.next.link().and_then(|n| engine.try_frame(n));
        if let Some(prev) = &prev {
            prev.update_header(|h| h.next = header.next);
            llt.add(prev);
        }
        if let Some(next) = &next {
            next.update_header(|h| h.prev = header.prev);
            llt.add(next);
        }
        if chain.head == id {
            chain.head = header.next;
        }
        if chain.tail == id {
            chain.tail = header.prev;
        }
        if let Some(pos) = chain.remote_starts.iter().position(|s| *s == id) {
            match &next {
                Some(next) => {
                    next.update_header(|h| h.started = header.started);
                    chain.remote_starts[pos] = next.id();
                }
                None => {
                    chain.remote_starts.remove(pos);
                }
            }
        }
        chain.count = chain.count.saturating_sub(1);

        frame.update_header(|h| {
            h.flags = 0;
            h.used = 0;
            h.prev = FrameId::NONE;
            h.next = FrameId::NONE;
        });
        llt.add(frame);
        llt.flush(engine)?;
        drop(content);

        engine.release_frame(frame)?;
        debug!(table = %self.name, frame = %id, frames = chain.count, "freed frame");
        Ok(true)
    }

    /// Free `frame` if nothing occupies or holds it.
    pub fn try_reclaim(&self, engine: &StorageEngine, frame: &Arc<FrameData>) -> Result<bool> {
        if frame.kind() != FrameKind::Data
            || frame.object_id() != self.id
            || frame.used() != 0
            || frame.is_current()
            || frame.tcounter() > 0
        {
            return Ok(false);
        }
        self.free_frame(engine, frame)
    }

    /// Apply a committed change to a frame's `used` counter, then reclaim
    /// the frame if it became empty.
    pub fn apply_size_delta(&self, engine: &StorageEngine, frame: FrameId, delta: i64) -> Result<bool> {
        let Some(frame) = engine.try_frame(frame) else {
            debug!(table = %self.name, frame = %frame, delta, "size delta for a released frame");
            return Ok(false);
        };
        let (used, clamped) = frame.adjust_used(delta);
        if clamped {
            warn!(table = %self.name, frame = %frame.id(), delta, used, "used counter clamped");
        }
        engine.write_header(&frame)?;
        self.try_reclaim(engine, &frame)
    }

    /// Claim frames found on disk: rebuild head, tail, count, remote starts,
    /// root and current slots.
    pub(crate) fn restore(&self, engine: &StorageEngine, frames: Vec<Arc<FrameData>>) -> Result<()> {
        let mut chain = self.chain.lock();
        let mut heads = Vec::new();
        let mut llt = Llt::new();

        for frame in &frames {
            let header = frame.header();
            if header.has_flag(frame_flags::ROOT) {
                chain.root = header.id;
            }
            if header.prev.is_none() {
                if header.started != 0 {
                    chain.remote_starts.push(header.id);
                } else {
                    heads.push(header.id);
                }
            }
            if header.has_flag(frame_flags::CURRENT) {
                let slot = self.partitions.iter().position(|f| *f == header.id.file);
                match slot {
                    Some(slot) if header.kind == FrameKind::Data => {
                        if let Some(old) = self.slots.slot(slot).install(Arc::clone(frame)) {
                            llt.add(&old);
                        }
                    }
                    _ => {
                        frame.set_current(false);
                        llt.add(frame);
                    }
                }
            }
        }

        if heads.len() > 1 {
            llt.flush(engine)?;
            return Err(Error::consistency(format!(
                "{} has {} chain heads",
                self.name,
                heads.len()
            )));
        }
        chain.count = frames.len();
        chain.remote_starts.sort();
        if let Some(&head) = heads.first() {
            chain.head = head;
            let mut tail = head;
            let mut cursor = engine.frame(head)?.next();
            let mut steps = 0;
            while let Some(id) = cursor.link() {
                steps += 1;
                if steps > frames.len() {
                    return Err(Error::consistency(format!("chain of {} loops", self.name)));
                }
                tail = id;
                cursor = engine.frame(id)?.next();
            }
            chain.tail = tail;
        }
        llt.flush(engine)?;

        info!(
            table = %self.name,
            frames = chain.count,
            remote_chains = chain.remote_starts.len(),
            "restored table chain"
        );
        Ok(())
    }

    /// Adopt a frame received from another node.
    pub(crate) fn adopt_remote(&self, frame: &Arc<FrameData>, started: bool) {
        let mut chain = self.chain.lock();
        if started && !chain.remote_starts.contains(&frame.id()) {
            chain.remote_starts.push(frame.id());
        }
        chain.count += 1;
        if let TableKind::Index { .. } = self.kind {
            if frame.is_root() {
                chain.root = frame.id();
            }
        }
    }

    /// Check chain links, accounting and ownership.
    pub fn verify_chain(&self, engine: &StorageEngine) -> Result<ChainReport> {
        let chain = self.chain();
        let mut report = ChainReport::default();
        let mut seen = HashSet::new();

        let starts = std::iter::once((chain.head, true))
            .chain(chain.remote_starts.iter().map(|s| (*s, false)));
        for (start, primary) in starts {
            let mut prev = FrameId::NONE;
            let mut cursor = start;
            while let Some(id) = cursor.link() {
                if !seen.insert(id) {
                    report.problems.push(format!("frame {} reached twice", id));
                    break;
                }
                let Some(frame) = engine.try_frame(id) else {
                    report.problems.push(format!("frame {} is not allocated", id));
                    break;
                };
                let header = frame.header();
                if header.object_id != self.id {
                    report.problems.push(format!("frame {} owned by object {}", id, header.object_id.0));
                }
                if header.prev != prev {
                    report.problems.push(format!(
                        "frame {} links back to {}, expected {}",
                        id, header.prev, prev
                    ));
                }
                if !header.has_flag(frame_flags::ALLOCATED) {
                    report.problems.push(format!("frame {} lacks the allocated flag", id));
                }
                if header.used > header.size {
                    report.problems.push(format!("frame {} uses {} of {} bytes", id, header.used, header.size));
                }
                if header.kind == FrameKind::Data {
                    let live = engine.load(&frame)?.as_data()?.live_bytes();
                    if live != header.used as usize {
                        report.problems.push(format!(
                            "frame {} accounts {} bytes but holds {}",
                            id, header.used, live
                        ));
                    }
                }
                report.frames += 1;
                report.used_bytes += header.used as u64;
                prev = id;
                cursor = header.next;
            }
            if primary && prev != chain.tail {
                report.problems.push(format!("walk ended at {}, tail is {}", prev, chain.tail));
            }
        }
        if report.frames != chain.count {
            report.problems.push(format!(
                "reached {} frames, chain counts {}",
                report.frames, chain.count
            ));
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Rows
    // ---------------------------------------------------------------------

    /// Store a new row and return its locator.
    pub fn persist(
        &self,
        engine: &StorageEngine,
        payload: &[u8],
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<ChunkLocator> {
        self.ensure_rows()?;
        let needed = CHUNK_HEADER_SIZE + payload.len();
        if needed > self.capacity() {
            return Err(Error::Storage(StorageError::InsufficientSpace {
                needed,
                available: self.capacity(),
            }));
        }
        let tracker = self.tracker(tracker);

        let locator = {
            let guard = self.slots.get_available_frame(None);
            self.append_row(engine, &guard, payload, tracker)?
        };
        if let Err(e) = self.index_row(engine, payload, locator, tracker) {
            self.discard_row(engine, locator, tracker)?;
            return Err(e);
        }
        trace!(table = %self.name, %locator, len = payload.len(), "persisted row");
        Ok(locator)
    }

    fn append_row(
        &self,
        engine: &StorageEngine,
        guard: &WaitGuard<'_>,
        payload: &[u8],
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<ChunkLocator> {
        let len = (CHUNK_HEADER_SIZE + payload.len()) as i64;
        // Frame this writer found full or freed
        let mut full: Option<FrameId> = None;
        loop {
            let frame = match guard.current() {
                Some(frame) if full.is_none() => frame,
                _ => self.frame_after(engine, guard.index(), full)?,
            };

            let appended = if !frame.is_allocated() {
                Append::Gone
            } else {
                let mut content = engine.load(&frame)?;
                // Freeing holds the content lock, so this check is final
                if !frame.is_allocated() {
                    Append::Gone
                } else {
                    let data = content.as_data_mut()?;
                    if !data.fits(payload.len()) {
                        if data.chunk_count() == 0 {
                            return Err(Error::consistency(format!(
                                "row of {} bytes does not fit an empty frame of {}",
                                payload.len(),
                                self.name
                            )));
                        }
                        Append::Full
                    } else {
                        let locator = ChunkLocator::new(frame.id(), data.fill() as u16);
                        if let Some(t) = tracker {
                            t.lock_chunk(engine, self, &frame, locator, UndoImage::Absent)?;
                        }
                        let pointer = data
                            .append(ChunkState::Normal, self.id, payload)
                            .ok_or_else(|| Error::consistency("append failed after fit check"))?;
                        debug_assert_eq!(pointer, locator.pointer);
                        if tracker.is_none() {
                            frame.adjust_used(len);
                        }
                        engine.write_frame(&frame, &content)?;
                        Append::Done(locator)
                    }
                }
            };

            match appended {
                Append::Done(locator) => {
                    if let Some(t) = tracker {
                        t.store_frame(engine, &frame, None, len)?;
                    }
                    return Ok(locator);
                }
                Append::Full | Append::Gone => {
                    trace!(table = %self.name, frame = %frame.id(), "current frame unusable; moving on");
                    full = Some(frame.id());
                }
            }
        }
    }

    /// Remove a just-appended row whose index maintenance failed.
    fn discard_row(
        &self,
        engine: &StorageEngine,
        locator: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<()> {
        let frame = self.frame_of(engine, locator.frame)?;
        let len = {
            let mut content = engine.load(&frame)?;
            let len = content.as_data_mut()?.remove(locator.pointer)? as i64;
            if tracker.is_none() {
                frame.adjust_used(-len);
            }
            engine.write_frame(&frame, &content)?;
            len
        };
        if let Some(t) = tracker {
            t.store_frame(engine, &frame, None, -len)?;
        }
        Ok(())
    }

    /// Read the chunk at `locator`, whatever its state.
    pub fn get(&self, engine: &StorageEngine, locator: ChunkLocator) -> Result<Chunk> {
        let frame = self.frame_of(engine, locator.frame)?;
        let record = engine.load(&frame)?.as_data()?.get(locator.pointer)?;
        Ok(Chunk::from_record(locator.frame, record))
    }

    /// Read the chunk at `locator`; a deleted chunk reports `DeletedRecord`.
    pub fn get_live(&self, engine: &StorageEngine, locator: ChunkLocator) -> Result<Chunk> {
        let chunk = self.get(engine, locator)?;
        if chunk.state == ChunkState::Deleted {
            return Err(deleted(locator));
        }
        Ok(chunk)
    }

    /// Replace a row. Equal-length payloads are rewritten in place; other
    /// lengths delete the old chunk and persist a new one, whose locator is
    /// returned.
    pub fn update(
        &self,
        engine: &StorageEngine,
        locator: ChunkLocator,
        payload: &[u8],
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<ChunkLocator> {
        self.ensure_rows()?;
        let tracker = self.tracker(tracker);
        let frame = self.frame_of(engine, locator.frame)?;

        let previous = {
            let mut content = engine.load(&frame)?;
            let data = content.as_data_mut()?;
            let current = data.get(locator.pointer)?;
            if current.state == ChunkState::Deleted {
                return Err(deleted(locator));
            }
            if current.payload.len() != payload.len() {
                None
            } else {
                if let Some(t) = tracker {
                    t.lock_chunk(
                        engine,
                        self,
                        &frame,
                        locator,
                        UndoImage::Row {
                            state: current.state,
                            owner: current.owner,
                            payload: current.payload.clone(),
                        },
                    )?;
                }
                data.overwrite(locator.pointer, payload)?;
                engine.write_frame(&frame, &content)?;
                Some(current.payload)
            }
        };

        match previous {
            Some(old) => {
                self.reindex_row(engine, &old, payload, locator, tracker)?;
                Ok(locator)
            }
            None => {
                self.delete(engine, locator, tracker)?;
                self.persist(engine, payload, tracker)
            }
        }
    }

    /// Delete a row. Transactional tables mark the chunk deleted and purge
    /// it at commit; others remove it at once.
    pub fn delete(
        &self,
        engine: &StorageEngine,
        locator: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<()> {
        self.ensure_rows()?;
        let tracker = self.tracker(tracker);
        let frame = self.frame_of(engine, locator.frame)?;

        let (payload, len) = {
            let mut content = engine.load(&frame)?;
            let data = content.as_data_mut()?;
            let current = data.get(locator.pointer)?;
            if current.state == ChunkState::Deleted {
                return Err(deleted(locator));
            }
            let len = current.byte_len() as i64;
            match tracker {
                Some(t) => {
                    t.lock_chunk(
                        engine,
                        self,
                        &frame,
                        locator,
                        UndoImage::Row {
                            state: current.state,
                            owner: current.owner,
                            payload: current.payload.clone(),
                        },
                    )?;
                    data.set_state(locator.pointer, ChunkState::Deleted)?;
                }
                None => {
                    data.remove(locator.pointer)?;
                    frame.adjust_used(-len);
                }
            }
            engine.write_frame(&frame, &content)?;
            (current.payload, len)
        };

        if let Some(t) = tracker {
            t.store_frame(engine, &frame, None, -len)?;
        }
        self.unindex_row(engine, &payload, locator, tracker)?;
        if tracker.is_none() {
            self.try_reclaim(engine, &frame)?;
        }
        trace!(table = %self.name, %locator, "deleted row");
        Ok(())
    }

    /// Mark a row archived. Not transactional.
    pub fn archive(&self, engine: &StorageEngine, locator: ChunkLocator) -> Result<()> {
        self.ensure_rows()?;
        let frame = self.frame_of(engine, locator.frame)?;
        let mut content = engine.load(&frame)?;
        let data = content.as_data_mut()?;
        if data.get(locator.pointer)?.state == ChunkState::Deleted {
            return Err(deleted(locator));
        }
        data.set_state(locator.pointer, ChunkState::Archived)?;
        engine.write_frame(&frame, &content)
    }

    /// Turn a deleted chunk into a hole; returns the bytes released.
    pub fn purge_chunk(&self, engine: &StorageEngine, locator: ChunkLocator) -> Result<usize> {
        let Some(frame) = engine.try_frame(locator.frame) else {
            return Ok(0);
        };
        let mut content = engine.load(&frame)?;
        let data = content.as_data_mut()?;
        match data.get(locator.pointer) {
            Ok(record) if record.state == ChunkState::Deleted => {
                let len = data.remove(locator.pointer)?;
                engine.write_frame(&frame, &content)?;
                Ok(len)
            }
            Ok(_) | Err(Error::Storage(StorageError::DeletedRecord(_))) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Turn any chunk into a hole; returns the bytes released.
    pub fn remove_chunk(&self, engine: &StorageEngine, locator: ChunkLocator) -> Result<usize> {
        let frame = self.frame_of(engine, locator.frame)?;
        let mut content = engine.load(&frame)?;
        let len = content.as_data_mut()?.remove(locator.pointer)?;
        if len > 0 {
            engine.write_frame(&frame, &content)?;
        }
        Ok(len)
    }

    /// Write a saved pre-image back to its chunk.
    pub fn restore_chunk(
        &self,
        engine: &StorageEngine,
        locator: ChunkLocator,
        state: ChunkState,
        owner: ObjectId,
        payload: &[u8],
    ) -> Result<()> {
        let frame = self.frame_of(engine, locator.frame)?;
        let mut content = engine.load(&frame)?;
        content
            .as_data_mut()?
            .restore(locator.pointer, state, 0, owner, payload)?;
        engine.write_frame(&frame, &content)
    }

    /// Chunks of one frame that are not deleted.
    pub fn chunks(&self, engine: &StorageEngine, frame: &FrameData) -> Result<Vec<Chunk>> {
        Ok(self
            .raw_chunks(engine, frame)?
            .into_iter()
            .filter(|c| c.state != ChunkState::Deleted)
            .collect())
    }

    /// Every chunk of one frame that still occupies space.
    pub fn raw_chunks(&self, engine: &StorageEngine, frame: &FrameData) -> Result<Vec<Chunk>> {
        let records = engine.load(frame)?.as_data()?.chunks()?;
        Ok(records
            .into_iter()
            .map(|r| Chunk::from_record(frame.id(), r))
            .collect())
    }

    /// Chunks of every frame that are not deleted, in chain order.
    pub fn scan(&self, engine: &StorageEngine) -> Result<Vec<Chunk>> {
        self.ensure_rows()?;
        let mut out = Vec::new();
        for frame in self.frames(engine)? {
            out.extend(self.chunks(engine, &frame)?);
        }
        Ok(out)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Keep generated ids above one already in use.
    pub fn observe_id(&self, id: u64) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    // ---------------------------------------------------------------------
    // Index maintenance
    // ---------------------------------------------------------------------

    /// Maintain `index` on every row of this table, starting with the rows
    /// already stored.
    pub fn bind_index(
        &self,
        engine: &StorageEngine,
        index: Arc<Table>,
        extractor: Arc<dyn KeyExtractor>,
    ) -> Result<()> {
        self.ensure_rows()?;
        if !index.kind().is_index() {
            return Err(Error::invalid_argument(format!("{} is not an index table", index.name())));
        }
        for chunk in self.scan(engine)? {
            let key = extractor.key(&chunk.payload)?;
            index.insert_key(engine, key, chunk.locator, None)?;
        }
        info!(table = %self.name, index = %index.name(), "bound index");
        self.indexes.write().push(IndexBinding { index, extractor });
        Ok(())
    }

    /// Build an in-memory secondary index. Only tables whose changes apply
    /// immediately can have one.
    pub fn create_memory_index(
        &self,
        engine: &StorageEngine,
        name: impl Into<String>,
        extractor: Arc<dyn KeyExtractor>,
    ) -> Result<()> {
        self.ensure_rows()?;
        if self.is_transactional() {
            return Err(Error::invalid_argument(format!(
                "{} is transactional; memory indexes need immediate changes",
                self.name
            )));
        }
        let mut entries: BTreeMap<Bytes, Vec<ChunkLocator>> = BTreeMap::new();
        for chunk in self.scan(engine)? {
            entries
                .entry(extractor.key(&chunk.payload)?)
                .or_default()
                .push(chunk.locator);
        }
        self.memory_indexes
            .write()
            .insert(name.into(), MemoryIndex { extractor, entries });
        Ok(())
    }

    pub fn memory_lookup(&self, name: &str, key: &[u8]) -> Result<Vec<ChunkLocator>> {
        let indexes = self.memory_indexes.read();
        let index = indexes
            .get(name)
            .ok_or_else(|| Error::not_found("memory index", name))?;
        Ok(index.entries.get(key).cloned().unwrap_or_default())
    }

    fn bindings(&self) -> Vec<(Arc<Table>, Arc<dyn KeyExtractor>)> {
        self.indexes
            .read()
            .iter()
            .map(|b| (Arc::clone(&b.index), Arc::clone(&b.extractor)))
            .collect()
    }

    fn memory_keys(&self, payload: &[u8]) -> Result<Vec<(String, Bytes)>> {
        self.memory_indexes
            .read()
            .iter()
            .map(|(name, index)| Ok((name.clone(), index.extractor.key(payload)?)))
            .collect()
    }

    fn index_row(
        &self,
        engine: &StorageEngine,
        payload: &[u8],
        locator: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<()> {
        let memory_keys = self.memory_keys(payload)?;
        let mut inserted: Vec<(Arc<Table>, Bytes)> = Vec::new();
        for (index, extractor) in self.bindings() {
            let result = extractor
                .key(payload)
                .and_then(|key| index.insert_key(engine, key.clone(), locator, tracker).map(|_| key));
            match result {
                Ok(key) => inserted.push((index, key)),
                Err(e) => {
                    for (index, key) in inserted {
                        index.remove_key(engine, &key, locator, None)?;
                    }
                    return Err(e);
                }
            }
        }
        if !memory_keys.is_empty() {
            let mut indexes = self.memory_indexes.write();
            for (name, key) in memory_keys {
                if let Some(index) = indexes.get_mut(&name) {
                    index.entries.entry(key).or_default().push(locator);
                }
            }
        }
        Ok(())
    }

    fn unindex_row(
        &self,
        engine: &StorageEngine,
        payload: &[u8],
        locator: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<()> {
        for (index, extractor) in self.bindings() {
            let key = extractor.key(payload)?;
            if !index.remove_key(engine, &key, locator, tracker)? {
                warn!(table = %self.name, index = %index.name(), %locator, "row had no index entry");
            }
        }
        let memory_keys = self.memory_keys(payload)?;
        if !memory_keys.is_empty() {
            let mut indexes = self.memory_indexes.write();
            for (name, key) in memory_keys {
                if let Some(index) = indexes.get_mut(&name) {
                    if let Some(locators) = index.entries.get_mut(&key) {
                        locators.retain(|l| *l != locator);
                        if locators.is_empty() {
                            index.entries.remove(&key);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn reindex_row(
        &self,
        engine: &StorageEngine,
        old: &[u8],
        new: &[u8],
        locator: ChunkLocator,
        tracker: Option<&dyn WriteTracker>,
    ) -> Result<()> {
        for (index, extractor) in self.bindings() {
            let old_key = extractor.key(old)?;
            let new_key = extractor.key(new)?;
            if old_key != new_key {
                index.remove_key(engine, &old_key, locator, tracker)?;
                index.insert_key(engine, new_key, locator, tracker)?;
            }
        }
        let old_keys = self.memory_keys(old)?;
        let new_keys = self.memory_keys(new)?;
        if old_keys != new_keys {
            let mut indexes = self.memory_indexes.write();
            for ((name, old_key), (_, new_key)) in old_keys.into_iter().zip(new_keys) {
                if old_key == new_key {
                    continue;
                }
                if let Some(index) = indexes.get_mut(&name) {
                    if let Some(locators) = index.entries.get_mut(&old_key) {
                        locators.retain(|l| *l != locator);
                        if locators.is_empty() {
                            index.entries.remove(&old_key);
                        }
                    }
                    index.entries.entry(new_key).or_default().push(locator);
                }
            }
        }
        Ok(())
    }

    /// Round-robin file for the next index page.
    pub(crate) fn next_tree_file(&self) -> FileId {
        let i = self.tree_cursor.fetch_add(1, Ordering::Relaxed);
        self.partitions[i % self.partitions.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::IdColumn;
    use cairn_common::testing::{fixtures, TestContext};

    fn engine(ctx: &TestContext) -> StorageEngine {
        StorageEngine::open(ctx.small_config()).unwrap()
    }

    fn plain_table(engine: &StorageEngine) -> Arc<Table> {
        engine
            .create_table(TableOptions::data(ObjectId(10), "plain").non_transactional())
            .unwrap()
    }

    #[test]
    fn test_persist_and_get() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);

        let row = fixtures::row(1, 24);
        let locator = table.persist(&engine, &row, None).unwrap();
        let chunk = table.get_live(&engine, locator).unwrap();
        assert_eq!(chunk.payload.as_ref(), row.as_slice());
        assert_eq!(chunk.owner, ObjectId(10));

        let frame = engine.frame(locator.frame).unwrap();
        assert_eq!(frame.used() as usize, CHUNK_HEADER_SIZE + 24);
        assert!(frame.is_current());
    }

    #[test]
    fn test_oversized_row_rejected() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        let err = table.persist(&engine, &vec![0u8; 250], None).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::InsufficientSpace { needed: 258, available: 192 })
        ));
        assert_eq!(table.frame_count(), 0);
    }

    #[test]
    fn test_full_frame_moves_to_new_tail() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);

        // 16-byte chunks, 12 per 192-byte body
        let locators: Vec<_> = fixtures::rows(13, 8)
            .iter()
            .map(|row| table.persist(&engine, row, None).unwrap())
            .collect();
        assert_ne!(locators[11].frame, locators[12].frame);

        let chain = table.chain();
        assert_eq!(chain.count, 2);
        assert_eq!(chain.head, locators[0].frame);
        assert_eq!(chain.tail, locators[12].frame);
        assert_eq!(engine.frame(chain.head).unwrap().next(), chain.tail);
        assert!(!engine.frame(chain.head).unwrap().is_current());
        assert!(table.verify_chain(&engine).unwrap().is_ok());
    }

    #[test]
    fn test_delete_reclaims_empty_frame() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        let locators: Vec<_> = fixtures::rows(14, 8)
            .iter()
            .map(|row| table.persist(&engine, row, None).unwrap())
            .collect();
        let first = locators[0].frame;

        for locator in &locators[..12] {
            table.delete(&engine, *locator, None).unwrap();
        }
        assert!(engine.try_frame(first).is_none());
        assert!(engine.free_list().contains(first));

        let chain = table.chain();
        assert_eq!(chain.count, 1);
        assert_eq!(chain.head, chain.tail);
        assert!(engine.frame(chain.head).unwrap().prev().is_none());
        assert!(table.verify_chain(&engine).unwrap().is_ok());

        let err = table.get_live(&engine, locators[0]).unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::FrameNotFound(_))));
    }

    #[test]
    fn test_current_frame_is_not_reclaimed() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        let locator = table.persist(&engine, &fixtures::row(1, 8), None).unwrap();
        table.delete(&engine, locator, None).unwrap();

        let frame = engine.frame(locator.frame).unwrap();
        assert_eq!(frame.used(), 0);
        assert!(frame.is_current());
        assert!(!table.try_reclaim(&engine, &frame).unwrap());
    }

    #[test]
    fn test_replaced_unused_frame_stays_allocated() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);

        let first = table.create_new_frame(&engine, 0).unwrap();
        let second = table.create_new_frame(&engine, 0).unwrap();
        assert_ne!(first.id(), second.id());
        assert!(engine.try_frame(first.id()).is_some());
        assert!(first.is_allocated());
        assert!(!first.is_current());

        // A writer that picked up the first frame can still append to it
        let mut content = engine.load(&first).unwrap();
        assert!(content.as_data_mut().unwrap().fits(8));
        drop(content);
        assert_eq!(table.chain().count, 2);
        assert!(table.verify_chain(&engine).unwrap().is_ok());
    }

    #[test]
    fn test_frame_after_settles_on_installed_frame() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);

        let installed = table.frame_after(&engine, 0, None).unwrap();
        let again = table.frame_after(&engine, 0, None).unwrap();
        assert_eq!(installed.id(), again.id());
        assert_eq!(table.chain().count, 1);

        let replacement = table.frame_after(&engine, 0, Some(installed.id())).unwrap();
        assert_ne!(replacement.id(), installed.id());
        assert!(replacement.is_current());
        // Only the writer that found the frame full moves the slot on
        let settled = table.frame_after(&engine, 0, Some(installed.id())).unwrap();
        assert_eq!(settled.id(), replacement.id());
        assert_eq!(table.chain().count, 2);
    }

    #[test]
    fn test_shared_slot_appends_never_fail() {
        let ctx = TestContext::new();
        let mut config = ctx.small_config();
        config.wait.acquire_timeout = std::time::Duration::from_micros(1);
        config.wait.poll_interval = std::time::Duration::from_micros(1);
        let engine = Arc::new(StorageEngine::open(config).unwrap());
        let table = plain_table(&engine);

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let engine = Arc::clone(&engine);
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..100u64)
                        .map(|i| table.persist(&engine, &fixtures::row(t * 1000 + i, 24), None))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();
        let mut locators = HashSet::new();
        for handle in handles {
            for locator in handle.join().unwrap().unwrap() {
                assert!(locators.insert(locator));
            }
        }

        assert_eq!(locators.len(), 800);
        assert_eq!(table.scan(&engine).unwrap().len(), 800);
        let report = table.verify_chain(&engine).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.used_bytes as usize, 800 * (CHUNK_HEADER_SIZE + 24));
    }

    #[test]
    fn test_update_in_place_and_relocating() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        let locator = table.persist(&engine, &fixtures::row(1, 16), None).unwrap();

        let same = table.update(&engine, locator, &fixtures::row(2, 16), None).unwrap();
        assert_eq!(same, locator);
        assert_eq!(table.get(&engine, locator).unwrap().decode::<Vec<u8>>().unwrap(), fixtures::row(2, 16));

        let moved = table.update(&engine, locator, &fixtures::row(3, 40), None).unwrap();
        assert_ne!(moved, locator);
        assert!(table.get(&engine, locator).is_err());
        assert_eq!(table.get_live(&engine, moved).unwrap().payload.len(), 40);
        assert!(table.verify_chain(&engine).unwrap().is_ok());
    }

    #[test]
    fn test_deleted_row_rejects_changes() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        let locator = table.persist(&engine, &fixtures::row(1, 8), None).unwrap();
        table.persist(&engine, &fixtures::row(2, 8), None).unwrap();
        table.delete(&engine, locator, None).unwrap();

        let err = table.delete(&engine, locator, None).unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::DeletedRecord(_))));
        assert!(table.update(&engine, locator, &fixtures::row(1, 8), None).is_err());
    }

    #[test]
    fn test_archive_keeps_row_visible() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        let locator = table.persist(&engine, &fixtures::row(1, 8), None).unwrap();
        table.archive(&engine, locator).unwrap();
        assert_eq!(table.get_live(&engine, locator).unwrap().state, ChunkState::Archived);
        assert_eq!(table.scan(&engine).unwrap().len(), 1);
    }

    #[test]
    fn test_partitions_spread_rows() {
        let ctx = TestContext::new();
        let engine = StorageEngine::open(ctx.engine_config(256, 4096, 2)).unwrap();
        let table = plain_table(&engine);

        let first = table.persist(&engine, &fixtures::row(1, 8), None).unwrap();
        let second = table.persist(&engine, &fixtures::row(2, 8), None).unwrap();
        assert_ne!(first.frame.file, second.frame.file);
        assert_eq!(table.slots().current_frames().len(), 2);
        assert_eq!(table.frames(&engine).unwrap().len(), 2);
    }

    #[test]
    fn test_memory_index_tracks_rows() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = engine
            .create_table(TableOptions::system(ObjectId(2), "catalog"))
            .unwrap();
        table.persist(&engine, &fixtures::row(5, 16), None).unwrap();
        table
            .create_memory_index(&engine, "by_id", Arc::new(IdColumn::new(0)))
            .unwrap();

        let key = crate::chunk::encode_id(5);
        let found = table.memory_lookup("by_id", &key).unwrap();
        assert_eq!(found.len(), 1);

        let added = table.persist(&engine, &fixtures::row(6, 16), None).unwrap();
        assert_eq!(table.memory_lookup("by_id", &crate::chunk::encode_id(6)).unwrap(), vec![added]);

        table.delete(&engine, found[0], None).unwrap();
        assert!(table.memory_lookup("by_id", &key).unwrap().is_empty());
        assert!(table.memory_lookup("missing", &key).is_err());
    }

    #[test]
    fn test_memory_index_needs_immediate_table() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = engine
            .create_table(TableOptions::data(ObjectId(3), "accounts"))
            .unwrap();
        assert!(table
            .create_memory_index(&engine, "by_id", Arc::new(IdColumn::new(0)))
            .is_err());
    }

    #[test]
    fn test_next_id_observes_existing() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        let table = plain_table(&engine);
        assert_eq!(table.next_id(), 1);
        table.observe_id(41);
        assert_eq!(table.next_id(), 42);
        table.observe_id(3);
        assert_eq!(table.next_id(), 43);
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let ctx = TestContext::new();
        let engine = engine(&ctx);
        plain_table(&engine);
        assert!(engine
            .create_table(TableOptions::data(ObjectId(10), "again"))
            .is_err());
    }
}
