//! A transaction and the write tracking it does for the storage layer.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use cairn_common::prelude::*;
use cairn_storage::{FrameData, StorageEngine, Table, UndoImage, WriteTracker};

use crate::locks::LockRegistry;
use crate::trans_frame::TransFrame;
use crate::undo::{UndoChunk, UndoLog};

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Default)]
struct TxnInner {
    frames: BTreeMap<FrameId, TransFrame>,
    undo: UndoLog,
    /// Row locks taken, with the owning table
    locked: Vec<(ObjectId, ChunkLocator)>,
}

/// Everything a finishing transaction has to reconcile
#[derive(Debug, Default)]
pub(crate) struct TxnWork {
    pub frames: Vec<TransFrame>,
    pub locked: Vec<(ObjectId, ChunkLocator)>,
    pub undo_frames: Vec<FrameId>,
}

pub struct Transaction {
    id: TxnId,
    kind: TransactionType,
    start_seq: u64,
    commit_seq: AtomicU64,
    statement: AtomicU32,
    state: Mutex<TxnState>,
    locks: Arc<LockRegistry>,
    inner: Mutex<TxnInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("start_seq", &self.start_seq)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(id: TxnId, kind: TransactionType, start_seq: u64, locks: Arc<LockRegistry>) -> Self {
        Self {
            id,
            kind,
            start_seq,
            commit_seq: AtomicU64::new(0),
            statement: AtomicU32::new(0),
            state: Mutex::new(TxnState::Active),
            locks,
            inner: Mutex::new(TxnInner::default()),
        }
    }

    /// Allocate the undo frames of a transaction that may write.
    pub(crate) fn start(&self, engine: &StorageEngine) -> Result<()> {
        if self.kind.is_read_only() {
            return Ok(());
        }
        self.inner.lock().undo.start(engine)
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Sequence stamped at begin; 0 unless the kind pins a snapshot
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    pub fn commit_seq(&self) -> Option<u64> {
        match self.commit_seq.load(Ordering::SeqCst) {
            0 => None,
            seq => Some(seq),
        }
    }

    pub fn statement(&self) -> u32 {
        self.statement.load(Ordering::SeqCst)
    }

    /// Start the next statement; returns its number.
    pub fn next_statement(&self) -> u32 {
        self.statement.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Frames changed so far, in id order
    pub fn touched_frames(&self) -> Vec<FrameId> {
        self.inner.lock().frames.keys().copied().collect()
    }

    pub fn undo_frame_count(&self) -> usize {
        self.inner.lock().undo.frame_count()
    }

    pub fn undo_frames(&self) -> Vec<FrameId> {
        self.inner.lock().undo.frame_ids().to_vec()
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.state() {
            TxnState::Active => {}
            TxnState::Committed => {
                return Err(Error::Transaction(TransactionError::AlreadyCommitted(self.id.0)));
            }
            TxnState::RolledBack => {
                return Err(Error::Transaction(TransactionError::AlreadyRolledBack(self.id.0)));
            }
        }
        if self.kind.is_read_only() {
            return Err(Error::Transaction(TransactionError::ReadOnly(self.id.0)));
        }
        Ok(())
    }

    /// Move out of `Active`. Fails if the transaction already finished.
    pub(crate) fn finish(&self, terminal: TxnState, commit_seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TxnState::Active => {
                *state = terminal;
                if terminal == TxnState::Committed {
                    self.commit_seq.store(commit_seq, Ordering::SeqCst);
                }
                Ok(())
            }
            TxnState::Committed => Err(Error::Transaction(TransactionError::AlreadyCommitted(self.id.0))),
            TxnState::RolledBack => Err(Error::Transaction(TransactionError::AlreadyRolledBack(self.id.0))),
        }
    }

    /// Hand over the bookkeeping to the commit or rollback path.
    pub(crate) fn take_work(&self) -> TxnWork {
        let mut inner = self.inner.lock();
        TxnWork {
            frames: std::mem::take(&mut inner.frames).into_values().collect(),
            locked: std::mem::take(&mut inner.locked),
            undo_frames: inner.undo.take_frames(),
        }
    }

    fn track<'a>(
        &self,
        engine: &StorageEngine,
        inner: &'a mut TxnInner,
        frame: &Arc<FrameData>,
        undo: Option<FrameId>,
        delta: i64,
    ) -> &'a mut TransFrame {
        let tf = inner.frames.entry(frame.id()).or_insert_with(|| {
            engine.retain_ref(frame.id());
            TransFrame::new(Arc::clone(frame))
        });
        if tf.merge(undo, delta) {
            frame.retain_txn();
        }
        tf
    }

    fn save_image(
        &self,
        engine: &StorageEngine,
        table: &Table,
        frame: &Arc<FrameData>,
        locator: ChunkLocator,
        image: UndoImage,
    ) -> Result<()> {
        let row_lock = !image.is_index();
        let mut inner = self.inner.lock();
        let chunk = UndoChunk {
            key: inner.undo.next_key(),
            txn: self.id,
            statement: self.statement(),
            table: table.id(),
            locator,
            image,
        };
        let at = inner.undo.append(engine, &chunk)?;
        if row_lock {
            inner.locked.push((table.id(), locator));
            self.locks.set_undo(locator, self.id, at);
        }
        let tf = self.track(engine, &mut inner, frame, Some(at.frame), 0);
        tf.undo_chunks.push((chunk.key, at));
        trace!(txn = %self.id, %locator, undo = %at.frame, key = chunk.key, "saved pre-image");
        Ok(())
    }
}

impl WriteTracker for Transaction {
    fn txn_id(&self) -> TxnId {
        self.id
    }

    fn lock_chunk(
        &self,
        engine: &StorageEngine,
        table: &Table,
        frame: &Arc<FrameData>,
        locator: ChunkLocator,
        image: UndoImage,
    ) -> Result<()> {
        self.ensure_writable()?;
        let row_lock = !image.is_index();
        if row_lock && !self.locks.acquire(locator, self.id, table.id())? {
            // Only the first pre-image of a chunk is kept
            return Ok(());
        }
        let saved = self.save_image(engine, table, frame, locator, image);
        if saved.is_err() && row_lock {
            self.locks.release_rows(self.id, &[locator]);
        }
        saved
    }

    fn store_frame(
        &self,
        engine: &StorageEngine,
        frame: &Arc<FrameData>,
        undo: Option<FrameId>,
        delta: i64,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        self.track(engine, &mut inner, frame, undo, delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::testing::{fixtures, TestContext};
    use cairn_storage::TableOptions;

    fn setup(ctx: &TestContext) -> (StorageEngine, Arc<Table>) {
        let engine = StorageEngine::open(ctx.small_config()).unwrap();
        let table = engine.create_table(TableOptions::data(ObjectId(10), "rows")).unwrap();
        (engine, table)
    }

    fn begin(engine: &StorageEngine, locks: &Arc<LockRegistry>, id: u64, kind: TransactionType) -> Transaction {
        let txn = Transaction::new(TxnId(id), kind, 0, Arc::clone(locks));
        txn.start(engine).unwrap();
        txn
    }

    #[test]
    fn test_first_pre_image_wins() {
        let ctx = TestContext::new();
        let (engine, table) = setup(&ctx);
        let locks = Arc::new(LockRegistry::new());
        let txn = begin(&engine, &locks, 1, TransactionType::ReadCommitted);

        let locator = table.persist(&engine, &fixtures::row(1, 16), Some(&txn)).unwrap();
        table.update(&engine, locator, &fixtures::row(2, 16), Some(&txn)).unwrap();

        let work = txn.take_work();
        assert_eq!(work.locked, vec![(ObjectId(10), locator)]);
        assert_eq!(work.frames.len(), 1);
        let tf = &work.frames[0];
        assert_eq!(tf.undo_chunks.len(), 1);
        assert_eq!(tf.delta, 24);
        assert_eq!(tf.frame.tcounter(), 1);
        assert!(engine.is_referenced(tf.id()));
    }

    #[test]
    fn test_conflict_leaves_chunk_untouched() {
        let ctx = TestContext::new();
        let (engine, table) = setup(&ctx);
        let locks = Arc::new(LockRegistry::new());
        let locator = table.persist(&engine, &fixtures::row(1, 16), None).unwrap();

        let first = begin(&engine, &locks, 1, TransactionType::ReadCommitted);
        let second = begin(&engine, &locks, 2, TransactionType::ReadCommitted);
        table.update(&engine, locator, &fixtures::row(2, 16), Some(&first)).unwrap();

        let err = table.delete(&engine, locator, Some(&second)).unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::WriteConflict { holder: 1, .. })
        ));
        let chunk = table.get_live(&engine, locator).unwrap();
        assert_eq!(chunk.payload.as_ref(), fixtures::row(2, 16).as_slice());
        assert!(second.touched_frames().is_empty());
    }

    #[test]
    fn test_fixed_is_read_only() {
        let ctx = TestContext::new();
        let (engine, table) = setup(&ctx);
        let locks = Arc::new(LockRegistry::new());
        let fixed = begin(&engine, &locks, 1, TransactionType::Fixed);
        assert_eq!(fixed.undo_frame_count(), 0);

        let err = table.persist(&engine, &fixtures::row(1, 8), Some(&fixed)).unwrap_err();
        assert!(matches!(err, Error::Transaction(TransactionError::ReadOnly(1))));
        assert!(table.scan(&engine).unwrap().is_empty());
    }

    #[test]
    fn test_finished_transaction_rejects_writes() {
        let ctx = TestContext::new();
        let (engine, table) = setup(&ctx);
        let locks = Arc::new(LockRegistry::new());
        let txn = begin(&engine, &locks, 1, TransactionType::ReadCommitted);

        txn.finish(TxnState::Committed, 5).unwrap();
        assert_eq!(txn.commit_seq(), Some(5));
        assert!(txn.finish(TxnState::RolledBack, 0).is_err());
        let err = table.persist(&engine, &fixtures::row(1, 8), Some(&txn)).unwrap_err();
        assert!(matches!(err, Error::Transaction(TransactionError::AlreadyCommitted(1))));
    }

    #[test]
    fn test_statement_counter() {
        let locks = Arc::new(LockRegistry::new());
        let txn = Transaction::new(TxnId(3), TransactionType::Serializable, 9, locks);
        assert_eq!(txn.statement(), 0);
        assert_eq!(txn.next_statement(), 1);
        assert_eq!(txn.next_statement(), 2);
        assert_eq!(txn.start_seq(), 9);
        assert!(txn.commit_seq().is_none());
    }
}
