//! Storage engine: data files, the frame registry and the table catalog.
//!
//! The engine owns every [`DataFile`], hands out frames, keeps the
//! in-memory [`FrameData`] of every allocated frame and writes frame content
//! through to disk. On open it replays the header journal and rebuilds the
//! registry and free list from a scan of frame headers; tables created
//! afterwards claim the frames that name them.

use dashmap::DashMap;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_common::utils::IdGenerator;

use crate::data_frame::{ChunkRecord, CHUNK_HEADER_SIZE};
use crate::datafile::DataFile;
use crate::frame::{frame_flags, Frame, FrameData, FrameHeader, FrameKind, FRAME_HEADER_SIZE};
use crate::free_list::{FreeFrame, FreeList};
use crate::journal::{HeaderJournal, JournalEntry};
use crate::table::{Table, TableOptions};

const FILE_PREFIX: &str = "frames_";
const FILE_SUFFIX: &str = ".cdb";

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub files: usize,
    pub frames: usize,
    pub loaded_frames: usize,
    pub free_frames: usize,
    pub tables: usize,
}

/// Embedded storage engine
pub struct StorageEngine {
    config: EngineConfig,
    files: DashMap<FileId, Arc<DataFile>>,
    next_file_id: AtomicU32,
    /// Every allocated frame, keyed by `FrameId::to_u64`
    frames: DashMap<u64, Arc<FrameData>>,
    free_list: FreeList,
    tables: DashMap<ObjectId, Arc<Table>>,
    journal: Mutex<HeaderJournal>,
    alloc_ids: IdGenerator,
    /// Transactions still naming a frame id
    frame_refs: DashMap<u64, usize>,
    /// Frames found by the open scan, waiting for their table
    discovered: Mutex<HashMap<ObjectId, Vec<Arc<FrameData>>>>,
    undo_cursor: AtomicUsize,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.config.data_dir)
            .field("stats", &self.stats())
            .finish()
    }
}

fn parse_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

impl StorageEngine {
    /// Open (or create) the engine rooted at `config.data_dir`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        std::fs::create_dir_all(&config.data_dir)?;
        let journal = HeaderJournal::open(&config.data_dir)?;

        let engine = Self {
            config,
            files: DashMap::new(),
            next_file_id: AtomicU32::new(1),
            frames: DashMap::new(),
            free_list: FreeList::new(),
            tables: DashMap::new(),
            journal: Mutex::new(journal),
            alloc_ids: IdGenerator::new(1),
            frame_refs: DashMap::new(),
            discovered: Mutex::new(HashMap::new()),
            undo_cursor: AtomicUsize::new(0),
        };

        engine.open_files()?;
        engine.replay_journal()?;
        while engine.files.len() < engine.config.storage.partitions {
            engine.create_file()?;
        }
        engine.scan_frames()?;

        let stats = engine.stats();
        info!(
            data_dir = %engine.config.data_dir.display(),
            files = stats.files,
            frames = stats.frames,
            free_frames = stats.free_frames,
            "storage engine opened"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.config.node_id)
    }

    fn file_path(&self, id: FileId) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}{:04}{}", FILE_PREFIX, id.0, FILE_SUFFIX))
    }

    fn open_files(&self) -> Result<()> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if let Some(id) = parse_file_name(&entry.file_name().to_string_lossy()) {
                found.push((id, entry.path()));
            }
        }
        found.sort();

        for (id, path) in found {
            let file = DataFile::open(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "cannot open data file");
                e
            })?;
            if file.id() != FileId(id) {
                return Err(Error::Storage(StorageError::CorruptHeader(format!(
                    "{} carries file id {}",
                    path.display(),
                    file.id().0
                ))));
            }
            self.next_file_id.fetch_max(id + 1, Ordering::SeqCst);
            debug!(file = id, path = %path.display(), "opened data file");
            self.files.insert(file.id(), Arc::new(file));
        }
        Ok(())
    }

    /// Finish an LLT flush interrupted by a crash.
    fn replay_journal(&self) -> Result<()> {
        let mut journal = self.journal.lock();
        let Some(entries) = journal.recover()? else {
            return Ok(());
        };
        for entry in &entries {
            self.file(entry.frame.file)?
                .write_header(entry.frame.pointer, &entry.header)?;
        }
        for file in self.files() {
            file.sync()?;
        }
        journal.clear()?;
        info!(headers = entries.len(), "replayed header journal");
        Ok(())
    }

    /// Rebuild the registry and free list from the frame headers on disk.
    fn scan_frames(&self) -> Result<()> {
        let mut discovered = self.discovered.lock();
        let mut undo_frames = 0usize;

        for file in self.files() {
            for header in file.scan_headers()? {
                self.alloc_ids.observe(header.alloc_id.0);

                if !header.has_flag(frame_flags::ALLOCATED) {
                    self.free_list.insert(FreeFrame {
                        frame: header.id,
                        object_id: header.object_id,
                        size: header.size,
                        passed: true,
                    });
                    continue;
                }

                // Undo frames only live as long as their transaction
                if header.kind == FrameKind::Undo {
                    let mut cleared = header;
                    cleared.set_flag(frame_flags::ALLOCATED, false);
                    file.write_header(header.id.pointer, &cleared.encode())?;
                    self.free_list.insert(FreeFrame {
                        frame: header.id,
                        object_id: header.object_id,
                        size: header.size,
                        passed: true,
                    });
                    undo_frames += 1;
                    continue;
                }

                let frame = Arc::new(FrameData::new(header));
                self.frames.insert(header.id.to_u64(), Arc::clone(&frame));
                discovered.entry(header.object_id).or_default().push(frame);
            }
        }

        if undo_frames > 0 {
            info!(undo_frames, "released undo frames left by an earlier run");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    /// Add a data file.
    pub fn create_file(&self) -> Result<Arc<DataFile>> {
        let id = FileId(self.next_file_id.fetch_add(1, Ordering::SeqCst));
        let path = self.file_path(id);
        let file = Arc::new(DataFile::create(&path, id, self.config.storage.extent_size)?);
        self.files.insert(id, Arc::clone(&file));
        info!(file = id.0, path = %path.display(), "created data file");
        Ok(file)
    }

    pub fn file(&self, id: FileId) -> Result<Arc<DataFile>> {
        self.files
            .get(&id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| Error::Storage(StorageError::FileNotFound(format!("file {}", id.0))))
    }

    /// All data files ordered by id.
    pub fn files(&self) -> Vec<Arc<DataFile>> {
        let mut files: Vec<_> = self.files.iter().map(|f| Arc::clone(f.value())).collect();
        files.sort_by_key(|f| f.id());
        files
    }

    /// The files tables partition their frames across by default.
    pub fn partition_files(&self) -> Vec<FileId> {
        self.files()
            .iter()
            .take(self.config.storage.partitions)
            .map(|f| f.id())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Tables
    // ---------------------------------------------------------------------

    /// Register a table. Frames found on disk for its object id are claimed
    /// and its chain, remote starts, root and current frames restored.
    pub fn create_table(&self, options: TableOptions) -> Result<Arc<Table>> {
        if self.tables.contains_key(&options.object_id) {
            return Err(Error::invalid_argument(format!(
                "object {} is already registered",
                options.object_id.0
            )));
        }
        if options.object_id == ObjectId::UNDO {
            return Err(Error::invalid_argument("object id is reserved for undo frames"));
        }

        let frame_size = options.frame_size.unwrap_or(self.config.storage.frame_size);
        if frame_size as usize <= FRAME_HEADER_SIZE * 2 || frame_size > MAX_FRAME_SIZE {
            return Err(Error::invalid_argument(format!("invalid frame size {}", frame_size)));
        }
        let partitions = if options.partitions.is_empty() {
            self.partition_files()
        } else {
            for file in &options.partitions {
                self.file(*file)?;
            }
            options.partitions.clone()
        };

        let table = Arc::new(Table::new(&options, frame_size, partitions, &self.config.wait));
        let claimed = self
            .discovered
            .lock()
            .remove(&options.object_id)
            .unwrap_or_default();
        if !claimed.is_empty() {
            table.restore(self, claimed)?;
        }

        self.tables.insert(options.object_id, Arc::clone(&table));
        debug!(
            object = options.object_id.0,
            name = %options.name,
            kind = ?options.kind,
            frame_size,
            frames = table.frame_count(),
            "registered table"
        );
        Ok(table)
    }

    pub fn table(&self, id: ObjectId) -> Result<Arc<Table>> {
        self.tables
            .get(&id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| Error::not_found("table", id.0.to_string()))
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.iter().map(|t| Arc::clone(t.value())).collect()
    }

    /// Objects with frames on disk that no table has claimed yet.
    pub fn unclaimed_objects(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.discovered.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    // ---------------------------------------------------------------------
    // Frames
    // ---------------------------------------------------------------------

    pub fn frame(&self, id: FrameId) -> Result<Arc<FrameData>> {
        self.try_frame(id)
            .ok_or_else(|| Error::frame_not_found(id.to_u64()))
    }

    pub fn try_frame(&self, id: FrameId) -> Option<Arc<FrameData>> {
        self.frames.get(&id.to_u64()).map(|f| Arc::clone(f.value()))
    }

    pub(crate) fn register_frame(&self, frame: Arc<FrameData>) {
        self.frames.insert(frame.id().to_u64(), frame);
    }

    /// Park a frame until its table is created.
    pub(crate) fn defer_frame(&self, object: ObjectId, frame: Arc<FrameData>) {
        self.discovered.lock().entry(object).or_default().push(frame);
    }

    pub(crate) fn observe_alloc_id(&self, id: AllocId) {
        self.alloc_ids.observe(id.0);
    }

    /// Allocate a frame of `size` bytes in `file` for `object`.
    ///
    /// The frame is written out empty with the `allocated` flag set before
    /// it is returned; it is not linked into any chain.
    pub fn allocate_frame(
        &self,
        file: FileId,
        size: u32,
        object: ObjectId,
        kind: FrameKind,
    ) -> Result<Arc<FrameData>> {
        if size as usize <= FRAME_HEADER_SIZE || size > MAX_FRAME_SIZE {
            return Err(Error::invalid_argument(format!("invalid frame size {}", size)));
        }
        let data_file = self.file(file)?;
        let allocation = data_file.allocate_frame(&self.free_list, size, |id| self.is_referenced(id))?;

        let alloc_id = AllocId(self.alloc_ids.next_id());
        let header = FrameHeader::new(allocation.frame, object, kind, size, alloc_id);
        let frame = Arc::new(FrameData::with_content(
            header,
            Frame::empty(kind, size as usize - FRAME_HEADER_SIZE),
        ));
        {
            let content = self.load(&frame)?;
            self.write_frame(&frame, &content)?;
        }
        self.frames.insert(frame.id().to_u64(), Arc::clone(&frame));

        trace!(
            frame = %frame.id(),
            object = object.0,
            ?kind,
            alloc_id = alloc_id.0,
            reused = allocation.reused,
            "allocated frame"
        );
        Ok(frame)
    }

    /// Allocate an undo frame, spreading undo frames over the first
    /// `undo_partitions` partition files.
    pub fn allocate_undo_frame(&self, size: u32) -> Result<Arc<FrameData>> {
        let files = self.partition_files();
        let spread = self.config.transaction.undo_partitions.min(files.len()).max(1);
        let file = files
            .get(self.undo_cursor.fetch_add(1, Ordering::Relaxed) % spread)
            .copied()
            .ok_or_else(|| Error::internal("no data file for undo frames"))?;
        self.allocate_frame(file, size, ObjectId::UNDO, FrameKind::Undo)
    }

    /// Return a frame to the free list. Its header is written with every
    /// flag cleared; the entry is passed unless a transaction still names
    /// the frame. Returns false if the frame was already released.
    pub fn release_frame(&self, frame: &FrameData) -> Result<bool> {
        let id = frame.id();
        if self.frames.remove(&id.to_u64()).is_none() {
            debug!(frame = %id, "frame already released");
            return Ok(false);
        }
        frame.update_header(|h| {
            h.flags = 0;
            h.prev = FrameId::NONE;
            h.next = FrameId::NONE;
        });
        self.write_header(frame)?;
        frame.evict_content();

        let passed = !self.is_referenced(id);
        self.free_list.insert(FreeFrame {
            frame: id,
            object_id: frame.object_id(),
            size: frame.size(),
            passed,
        });
        trace!(frame = %id, passed, "released frame");
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Content
    // ---------------------------------------------------------------------

    /// Lock the frame's content, reading it from disk if it is not cached.
    pub fn load<'a>(&self, frame: &'a FrameData) -> Result<MappedMutexGuard<'a, Frame>> {
        let mut guard = frame.content().lock();
        if guard.is_none() {
            let id = frame.id();
            let bytes = self
                .file(id.file)?
                .read_data(id.pointer, frame.size() as usize)?;
            let header = FrameHeader::decode(&bytes[..FRAME_HEADER_SIZE])?;
            if header.id != id {
                error!(frame = %id, embedded = %header.id, "frame on disk names another location");
                return Err(Error::corrupted(
                    id.to_u64(),
                    format!("embedded identity {} on read", header.id),
                ));
            }
            *guard = Some(Frame::decode(&header, &bytes[FRAME_HEADER_SIZE..])?);
            trace!(frame = %id, "loaded frame content");
        }
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| Error::internal("frame content missing after load"))
    }

    /// Write `content` and the frame header through to disk. The header's
    /// fill and chunk count follow the content; index frames also account
    /// their encoded size as `used`.
    pub fn write_frame(&self, frame: &FrameData, content: &Frame) -> Result<()> {
        let header = frame.update_header(|h| {
            h.fill = content.fill();
            h.chunk_count = content.chunk_count();
            if let Frame::Index(index) = content {
                h.used = index.encoded_len() as u32;
            }
            *h
        });
        let mut bytes = Vec::with_capacity(frame.size() as usize);
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(&content.encode_body(frame.capacity()));
        self.file(frame.id().file)?
            .write_frame(frame.id().pointer, &bytes)
    }

    /// Write only the header of one frame.
    pub fn write_header(&self, frame: &FrameData) -> Result<()> {
        self.file(frame.id().file)?
            .write_header(frame.id().pointer, &frame.header().encode())
    }

    /// Write the headers of an LLT through the journal.
    pub fn flush_headers(&self, frames: &[Arc<FrameData>]) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let entries: Vec<JournalEntry> = frames
            .iter()
            .map(|f| JournalEntry {
                frame: f.id(),
                header: f.header().encode(),
            })
            .collect();

        let mut journal = self.journal.lock();
        journal.write_batch(&entries)?;
        for entry in &entries {
            self.file(entry.frame.file)?
                .write_header(entry.frame.pointer, &entry.header)?;
        }
        if self.config.storage.sync_on_flush {
            let mut synced = Vec::new();
            for entry in &entries {
                if !synced.contains(&entry.frame.file) {
                    self.file(entry.frame.file)?.sync()?;
                    synced.push(entry.frame.file);
                }
            }
        }
        journal.clear()?;
        trace!(headers = entries.len(), "flushed LLT");
        Ok(())
    }

    /// Append an undo record to an undo frame; `None` if it does not fit.
    pub fn append_undo(&self, frame: &FrameData, payload: &[u8]) -> Result<Option<u16>> {
        let mut content = self.load(frame)?;
        let Some(pointer) = content
            .as_data_mut()?
            .append(ChunkState::Normal, ObjectId::UNDO, payload)
        else {
            return Ok(None);
        };
        frame.adjust_used((CHUNK_HEADER_SIZE + payload.len()) as i64);
        self.write_frame(frame, &content)?;
        Ok(Some(pointer))
    }

    pub fn read_chunk(&self, frame: &FrameData, pointer: u16) -> Result<ChunkRecord> {
        self.load(frame)?.as_data()?.get(pointer)
    }

    // ---------------------------------------------------------------------
    // References and caching
    // ---------------------------------------------------------------------

    /// Record that a transaction names `frame`.
    pub fn retain_ref(&self, frame: FrameId) -> usize {
        let mut count = self.frame_refs.entry(frame.to_u64()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a reference; a freed frame becomes reusable at zero.
    pub fn release_ref(&self, frame: FrameId) -> usize {
        let key = frame.to_u64();
        let remaining = match self.frame_refs.get_mut(&key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return 0,
        };
        if remaining == 0 {
            self.frame_refs.remove_if(&key, |_, count| *count == 0);
            if self.free_list.pass(frame) {
                trace!(frame = %frame, "free frame passed");
            }
        }
        remaining
    }

    pub fn is_referenced(&self, frame: FrameId) -> bool {
        self.frame_refs
            .get(&frame.to_u64())
            .is_some_and(|count| *count > 0)
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Drop cached content of frames that are not current. Content is
    /// written through, so nothing is lost.
    pub fn evict_idle_frames(&self) -> usize {
        let evicted = self
            .frames
            .iter()
            .filter(|f| !f.is_current())
            .filter(|f| f.evict_content())
            .count();
        debug!(evicted, "evicted idle frame content");
        evicted
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            files: self.files.len(),
            frames: self.frames.len(),
            loaded_frames: self.frames.iter().filter(|f| f.is_loaded()).count(),
            free_frames: self.free_list.len(),
            tables: self.tables.len(),
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn sync_all(&self) -> Result<()> {
        for file in self.files() {
            file.sync()?;
        }
        Ok(())
    }

    /// Sync every file and log final statistics.
    pub fn shutdown(&self) -> Result<()> {
        self.sync_all()?;
        let stats = self.stats();
        info!(
            frames = stats.frames,
            free_frames = stats.free_frames,
            tables = stats.tables,
            "storage engine shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::testing::TestContext;

    #[test]
    fn test_open_creates_partition_files() {
        let ctx = TestContext::new();
        let config = ctx.engine_config(256, 4096, 3);
        {
            let engine = StorageEngine::open(config.clone()).unwrap();
            assert_eq!(engine.partition_files(), vec![FileId(1), FileId(2), FileId(3)]);
            assert!(ctx.data_dir().join("frames_0001.cdb").exists());
        }
        let engine = StorageEngine::open(config).unwrap();
        assert_eq!(engine.stats().files, 3);
    }

    #[test]
    fn test_allocate_and_reload() {
        let ctx = TestContext::new();
        let engine = StorageEngine::open(ctx.small_config()).unwrap();
        let frame = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        assert_eq!(frame.id().pointer, SYSTEM_FRAME_SIZE);
        assert!(frame.is_allocated());

        {
            let mut content = engine.load(&frame).unwrap();
            content
                .as_data_mut()
                .unwrap()
                .append(ChunkState::Normal, ObjectId(7), b"payload")
                .unwrap();
            engine.write_frame(&frame, &content).unwrap();
        }
        assert!(frame.evict_content());
        assert!(!frame.is_loaded());

        let record = engine.read_chunk(&frame, FRAME_HEADER_SIZE as u16).unwrap();
        assert_eq!(record.payload.as_ref(), b"payload");
        assert_eq!(frame.header().chunk_count, 1);
    }

    #[test]
    fn test_released_frame_is_reused() {
        let ctx = TestContext::new();
        let engine = StorageEngine::open(ctx.small_config()).unwrap();
        let first = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        let id = first.id();
        let old_alloc = first.alloc_id();

        assert!(engine.release_frame(&first).unwrap());
        assert!(!engine.release_frame(&first).unwrap());
        assert!(engine.free_list().get(id).unwrap().passed);
        assert!(engine.try_frame(id).is_none());

        let second = engine
            .allocate_frame(FileId(1), 256, ObjectId(8), FrameKind::Data)
            .unwrap();
        assert_eq!(second.id(), id);
        assert_ne!(second.alloc_id(), old_alloc);
        assert!(engine.free_list().is_empty());
    }

    #[test]
    fn test_referenced_frame_waits_for_release() {
        let ctx = TestContext::new();
        let engine = StorageEngine::open(ctx.small_config()).unwrap();
        let frame = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        let id = frame.id();

        engine.retain_ref(id);
        engine.release_frame(&frame).unwrap();
        assert!(!engine.free_list().get(id).unwrap().passed);

        let other = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        assert_ne!(other.id(), id);

        assert_eq!(engine.release_ref(id), 0);
        assert!(engine.free_list().get(id).unwrap().passed);
        let reused = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        assert_eq!(reused.id(), id);
    }

    #[test]
    fn test_journal_replayed_on_open() {
        let ctx = TestContext::new();
        let config = ctx.small_config();
        let (id, mut header) = {
            let engine = StorageEngine::open(config.clone()).unwrap();
            let frame = engine
                .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
                .unwrap();
            (frame.id(), frame.header())
        };

        // A batch that reached the journal but not the data file
        header.next = FrameId::new(FileId(1), 4000);
        {
            let mut journal = HeaderJournal::open(&config.data_dir).unwrap();
            journal
                .write_batch(&[JournalEntry {
                    frame: id,
                    header: header.encode(),
                }])
                .unwrap();
        }

        let engine = StorageEngine::open(config.clone()).unwrap();
        assert_eq!(engine.frame(id).unwrap().next(), header.next);
        assert!(HeaderJournal::open(&config.data_dir).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_undo_frames_released_on_open() {
        let ctx = TestContext::new();
        let config = ctx.small_config();
        let undo_id = {
            let engine = StorageEngine::open(config.clone()).unwrap();
            let undo = engine.allocate_undo_frame(256).unwrap();
            engine.append_undo(&undo, b"pre-image").unwrap().unwrap();
            undo.id()
        };

        let engine = StorageEngine::open(config).unwrap();
        assert!(engine.try_frame(undo_id).is_none());
        assert!(engine.free_list().get(undo_id).unwrap().passed);
    }

    #[test]
    fn test_unclaimed_frames_wait_for_their_table() {
        let ctx = TestContext::new();
        let config = ctx.small_config();
        {
            let engine = StorageEngine::open(config.clone()).unwrap();
            engine
                .allocate_frame(FileId(1), 256, ObjectId(9), FrameKind::Data)
                .unwrap();
        }
        let engine = StorageEngine::open(config).unwrap();
        assert_eq!(engine.unclaimed_objects(), vec![ObjectId(9)]);
        assert_eq!(engine.stats().frames, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let ctx = TestContext::new();
        let mut config = ctx.small_config();
        config.storage.partitions = 0;
        let err = StorageEngine::open(config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_evict_idle_frames() {
        let ctx = TestContext::new();
        let engine = StorageEngine::open(ctx.small_config()).unwrap();
        let a = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        let b = engine
            .allocate_frame(FileId(1), 256, ObjectId(7), FrameKind::Data)
            .unwrap();
        b.set_current(true);

        assert_eq!(engine.evict_idle_frames(), 1);
        assert!(!a.is_loaded());
        assert!(b.is_loaded());
    }
}
