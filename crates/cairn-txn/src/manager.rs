//! Transaction manager: begin, commit, rollback and versioned reads.
//!
//! Commit and rollback reconcile every frame a transaction touched. Each
//! step logs its own failures and moves on, so a transaction always reaches
//! a terminal state; a frame freed underneath counts as already reconciled.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_common::utils::IdGenerator;
use cairn_storage::{Chunk, StorageEngine, Table, UndoImage};

use crate::locks::{LockRegistry, LockStats, RetainedVersion};
use crate::trans_frame::TransFrame;
use crate::transaction::{Transaction, TxnState};
use crate::undo::{read_undo, UndoRef};
use crate::CommitListener;

/// Transaction manager statistics
#[derive(Debug, Clone, Default)]
pub struct TxnStats {
    pub txns_started: u64,
    pub txns_committed: u64,
    pub txns_rolled_back: u64,
    pub undo_frames_freed: u64,
    pub step_failures: u64,
}

fn is_gone(err: &Error) -> bool {
    matches!(
        err,
        Error::Storage(StorageError::FrameNotFound(_)) | Error::Storage(StorageError::DeletedRecord(_))
    )
}

/// The chunk a reader sees for a saved pre-image
fn visible_image(locator: ChunkLocator, image: UndoImage) -> Option<Chunk> {
    match image {
        UndoImage::Row {
            state: ChunkState::Normal,
            owner,
            payload,
        } => Some(Chunk {
            locator,
            state: ChunkState::Normal,
            owner,
            payload,
        }),
        _ => None,
    }
}

pub struct TransactionManager {
    engine: Arc<StorageEngine>,
    locks: Arc<LockRegistry>,
    txn_ids: IdGenerator,
    sequence: IdGenerator,
    active: DashMap<TxnId, Arc<Transaction>>,
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
    stats: Mutex<TxnStats>,
}

impl TransactionManager {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            locks: Arc::new(LockRegistry::new()),
            txn_ids: IdGenerator::new(1),
            sequence: IdGenerator::new(1),
            active: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            stats: Mutex::new(TxnStats::default()),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn stats(&self) -> TxnStats {
        self.stats.lock().clone()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    pub fn add_listener(&self, listener: Arc<dyn CommitListener>) {
        self.listeners.write().push(listener);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn transaction(&self, id: TxnId) -> Result<Arc<Transaction>> {
        self.active
            .get(&id)
            .map(|t| Arc::clone(&t))
            .ok_or(Error::Transaction(TransactionError::NotFound(id.0)))
    }

    /// Begin a transaction. Writable kinds get their undo frames now.
    pub fn begin(&self, kind: TransactionType) -> Result<Arc<Transaction>> {
        let id = TxnId(self.txn_ids.next_id());
        let start_seq = if kind.stamps_sequence() {
            self.sequence.next_id()
        } else {
            0
        };
        let txn = Arc::new(Transaction::new(id, kind, start_seq, Arc::clone(&self.locks)));
        txn.start(&self.engine)?;
        self.active.insert(id, Arc::clone(&txn));
        self.stats.lock().txns_started += 1;
        debug!(txn = %id, ?kind, start_seq, "began transaction");
        Ok(txn)
    }

    fn step<T>(&self, txn: TxnId, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) if is_gone(&e) => {
                debug!(txn = %txn, step, error = %e, "already reconciled");
                None
            }
            Err(e) => {
                warn!(txn = %txn, step, error = %e, "transaction step failed");
                self.stats.lock().step_failures += 1;
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Commit
    // ---------------------------------------------------------------------

    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        let id = txn.id();
        txn.finish(TxnState::Committed, self.sequence.next_id())?;
        let work = txn.take_work();
        let touched: Vec<FrameId> = work.frames.iter().map(TransFrame::id).collect();

        for listener in self.listeners.read().iter() {
            if let Err(e) = listener.on_commit(txn, &touched) {
                warn!(txn = %id, error = %e, "commit listener failed");
            }
        }

        if self.locks.has_readers(id) {
            let versions: HashMap<ChunkLocator, RetainedVersion> = work
                .locked
                .iter()
                .filter_map(|(table, locator)| {
                    let undo = self.locks.lock_of(*locator)?.undo?;
                    Some((*locator, RetainedVersion { table: *table, undo }))
                })
                .collect();
            debug!(txn = %id, versions = versions.len(), "retained versions for readers");
            self.locks.retain(id, versions);
        }

        for (table, locator) in &work.locked {
            let purged = self.engine.table(*table).and_then(|t| t.purge_chunk(&self.engine, *locator));
            self.step(id, "purge", purged);
        }
        let locators: Vec<ChunkLocator> = work.locked.iter().map(|(_, l)| *l).collect();
        self.locks.release_rows(id, &locators);

        for tf in work.frames.iter().filter(|tf| tf.undo.is_some()) {
            tf.frame.release_txn();
        }

        if self.locks.has_readers(id) {
            debug!(txn = %id, frames = work.undo_frames.len(), "deferred undo frames");
            self.locks.defer_frames(id, work.undo_frames);
        } else {
            self.free_undo_frames(id, &work.undo_frames);
        }

        for tf in work.frames.iter().filter(|tf| !tf.is_index()) {
            let applied = self.engine.table(tf.table).and_then(|table| {
                if tf.delta != 0 {
                    table.apply_size_delta(&self.engine, tf.id(), tf.delta)
                } else {
                    table.try_reclaim(&self.engine, &tf.frame)
                }
            });
            self.step(id, "size delta", applied);
        }
        self.release_frames(&work.frames);

        self.finish_reader(id);
        self.active.remove(&id);
        self.stats.lock().txns_committed += 1;
        debug!(txn = %id, frames = touched.len(), commit_seq = ?txn.commit_seq(), "committed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Rollback
    // ---------------------------------------------------------------------

    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        let id = txn.id();
        txn.finish(TxnState::RolledBack, 0)?;
        let work = txn.take_work();
        let (index_frames, data_frames): (Vec<&TransFrame>, Vec<&TransFrame>) =
            work.frames.iter().partition(|tf| tf.is_index());

        for at in Self::newest_first(&index_frames) {
            let undone = self.undo_index(at);
            self.step(id, "index undo", undone);
        }
        for at in Self::newest_first(&data_frames) {
            let undone = self.undo_row(at);
            self.step(id, "row undo", undone);
        }

        let locators: Vec<ChunkLocator> = work.locked.iter().map(|(_, l)| *l).collect();
        self.locks.release_rows(id, &locators);
        for tf in work.frames.iter().filter(|tf| tf.undo.is_some()) {
            tf.frame.release_txn();
        }
        if self.locks.has_readers(id) {
            self.locks.defer_frames(id, work.undo_frames);
        } else {
            self.free_undo_frames(id, &work.undo_frames);
        }

        for tf in &data_frames {
            let reclaimed = self
                .engine
                .table(tf.table)
                .and_then(|table| table.try_reclaim(&self.engine, &tf.frame));
            self.step(id, "reclaim", reclaimed);
        }
        self.release_frames(&work.frames);

        self.finish_reader(id);
        self.active.remove(&id);
        self.stats.lock().txns_rolled_back += 1;
        debug!(txn = %id, frames = work.frames.len(), "rolled back");
        Ok(())
    }

    fn newest_first(frames: &[&TransFrame]) -> Vec<UndoRef> {
        let mut chunks: Vec<(u64, UndoRef)> = frames
            .iter()
            .flat_map(|tf| tf.undo_chunks.iter().copied())
            .collect();
        chunks.sort_by(|a, b| b.0.cmp(&a.0));
        chunks.into_iter().map(|(_, at)| at).collect()
    }

    fn undo_index(&self, at: UndoRef) -> Result<()> {
        let chunk = read_undo(&self.engine, at)?;
        let index = self.engine.table(chunk.table)?;
        match chunk.image {
            UndoImage::IndexInsert { key, row } => {
                if !index.remove_key(&self.engine, &key, row, None)? {
                    debug!(index = %index.name(), %row, "inserted key already gone");
                }
                Ok(())
            }
            UndoImage::IndexRemove { key, row } => index.insert_key(&self.engine, key, row, None),
            other => Err(Error::consistency(format!("row image {:?} on an index frame", other))),
        }
    }

    fn undo_row(&self, at: UndoRef) -> Result<()> {
        let chunk = read_undo(&self.engine, at)?;
        let table = self.engine.table(chunk.table)?;
        match chunk.image {
            UndoImage::Absent => table.remove_chunk(&self.engine, chunk.locator).map(|_| ()),
            UndoImage::Row { state, owner, payload } => {
                table.restore_chunk(&self.engine, chunk.locator, state, owner, &payload)
            }
            other => Err(Error::consistency(format!("index image {:?} on a data frame", other))),
        }
    }

    // ---------------------------------------------------------------------
    // Frame release
    // ---------------------------------------------------------------------

    fn free_undo_frames(&self, txn: TxnId, frames: &[FrameId]) {
        let mut seen = HashSet::new();
        let mut freed = 0;
        for id in frames.iter().filter(|id| seen.insert(**id)) {
            let released = self.engine.frame(*id).and_then(|frame| self.engine.release_frame(&frame));
            if let Some(true) = self.step(txn, "free undo frame", released) {
                freed += 1;
            }
        }
        self.stats.lock().undo_frames_freed += freed;
    }

    fn release_frames(&self, frames: &[TransFrame]) {
        for tf in frames {
            self.engine.release_ref(tf.id());
        }
    }

    fn finish_reader(&self, reader: TxnId) {
        for released in self.locks.release_reader(reader) {
            trace!(reader = %reader, writer = %released.writer, "released retrieve locks");
            self.free_undo_frames(released.writer, &released.undo_frames);
        }
    }

    /// Drop the retrieve locks `reader` holds without ending it.
    pub fn release_reader(&self, reader: &Transaction) {
        self.finish_reader(reader.id());
    }

    // ---------------------------------------------------------------------
    // Versioned reads
    // ---------------------------------------------------------------------

    /// The version of the chunk at `locator` that `reader` sees, if any.
    pub fn read(&self, reader: &Transaction, table: &Table, locator: ChunkLocator) -> Result<Option<Chunk>> {
        if reader.kind().stamps_sequence() {
            if let Some(version) = self.locks.retained_for(reader.id(), locator) {
                return self.retained_chunk(locator, version.undo);
            }
        }
        let snapshot = self.snapshot(table, locator)?;
        self.resolve(Some(reader), table, locator, snapshot)
    }

    /// Latest committed version, for callers outside any transaction.
    pub fn read_latest(&self, table: &Table, locator: ChunkLocator) -> Result<Option<Chunk>> {
        let snapshot = self.snapshot(table, locator)?;
        self.resolve(None, table, locator, snapshot)
    }

    /// Every chunk of `table` that `reader` sees, in chain order.
    pub fn scan_visible(&self, reader: &Transaction, table: &Table) -> Result<Vec<Chunk>> {
        let retained: HashMap<ChunkLocator, RetainedVersion> = if reader.kind().stamps_sequence() {
            self.locks.retained_in(reader.id(), table.id()).into_iter().collect()
        } else {
            HashMap::new()
        };

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for frame in table.frames(&self.engine)? {
            for chunk in table.raw_chunks(&self.engine, &frame)? {
                let locator = chunk.locator;
                seen.insert(locator);
                let visible = match retained.get(&locator) {
                    Some(version) => self.retained_chunk(locator, version.undo)?,
                    None => self.resolve(Some(reader), table, locator, Some(chunk))?,
                };
                out.extend(visible);
            }
        }

        // Versions whose chunks were purged after the writer committed
        let mut purged: Vec<_> = retained.into_iter().filter(|(l, _)| !seen.contains(l)).collect();
        purged.sort_by_key(|(l, _)| *l);
        for (locator, version) in purged {
            out.extend(self.retained_chunk(locator, version.undo)?);
        }
        Ok(out)
    }

    fn snapshot(&self, table: &Table, locator: ChunkLocator) -> Result<Option<Chunk>> {
        match table.get(&self.engine, locator) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(e) if is_gone(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn retained_chunk(&self, locator: ChunkLocator, undo: UndoRef) -> Result<Option<Chunk>> {
        let chunk = read_undo(&self.engine, undo)?;
        Ok(visible_image(locator, chunk.image))
    }

    /// Apply row locks to a chunk read under its frame's content lock.
    fn resolve(
        &self,
        reader: Option<&Transaction>,
        table: &Table,
        locator: ChunkLocator,
        snapshot: Option<Chunk>,
    ) -> Result<Option<Chunk>> {
        let reader_id = reader.map(Transaction::id);
        if let Some(lock) = self.locks.lock_of(locator) {
            if Some(lock.owner) != reader_id {
                if let Some(reader) = reader_id {
                    self.locks.add_retrieve(reader, lock.owner);
                }
                // Without an undo reference the snapshot predates the change
                if let Some(at) = lock.undo {
                    match read_undo(&self.engine, at) {
                        Ok(chunk) => return Ok(visible_image(locator, chunk.image)),
                        Err(e) if is_gone(&e) => {
                            debug!(%locator, writer = %lock.owner, "writer finished during read");
                            return Ok(self.snapshot(table, locator)?.filter(Chunk::is_live));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(snapshot.filter(Chunk::is_live))
    }
}
