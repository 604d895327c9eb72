//! Row ownership and reader registrations shared by all transactions.
//!
//! A row lock names the transaction that changed a chunk and where its
//! pre-image lives. Readers that look past a row lock register a retrieve
//! lock against the writer; while any remain, a committed writer leaves its
//! pre-images retained and its undo frames deferred, so the readers keep
//! resolving the versions they saw.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use cairn_common::prelude::*;

use crate::undo::UndoRef;

/// Ownership of one chunk by a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLock {
    pub owner: TxnId,
    pub table: ObjectId,
    /// Unset until the pre-image has been written
    pub undo: Option<UndoRef>,
}

/// Pre-image kept for readers after its writer committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedVersion {
    pub table: ObjectId,
    pub undo: UndoRef,
}

/// What became reclaimable when a reader let go of a writer
#[derive(Debug)]
pub struct Released {
    pub writer: TxnId,
    pub undo_frames: Vec<FrameId>,
}

#[derive(Debug, Default)]
struct RetrieveLocks {
    by_writer: HashMap<TxnId, HashSet<TxnId>>,
    by_reader: HashMap<TxnId, HashSet<TxnId>>,
}

/// Lock registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub row_locks: usize,
    pub retrieve_locks: usize,
    pub retained_writers: usize,
    pub deferred_frames: usize,
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    owners: DashMap<ChunkLocator, RowLock>,
    retrieve: Mutex<RetrieveLocks>,
    retained: DashMap<TxnId, HashMap<ChunkLocator, RetainedVersion>>,
    deferred: DashMap<TxnId, Vec<FrameId>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Row locks
    // ---------------------------------------------------------------------

    /// Take the lock on `locator` for `owner`.
    ///
    /// Returns true if the lock is new, false if `owner` already held it.
    /// Another holder is a write conflict.
    pub fn acquire(&self, locator: ChunkLocator, owner: TxnId, table: ObjectId) -> Result<bool> {
        match self.owners.entry(locator) {
            Entry::Occupied(held) if held.get().owner == owner => Ok(false),
            Entry::Occupied(held) => Err(Error::Transaction(TransactionError::WriteConflict {
                locator: locator.to_string(),
                holder: held.get().owner.0,
            })),
            Entry::Vacant(slot) => {
                slot.insert(RowLock {
                    owner,
                    table,
                    undo: None,
                });
                Ok(true)
            }
        }
    }

    /// Record where the pre-image of a held lock was written.
    pub fn set_undo(&self, locator: ChunkLocator, owner: TxnId, undo: UndoRef) {
        if let Some(mut lock) = self.owners.get_mut(&locator) {
            if lock.owner == owner {
                lock.undo = Some(undo);
            }
        }
    }

    pub fn lock_of(&self, locator: ChunkLocator) -> Option<RowLock> {
        self.owners.get(&locator).map(|lock| *lock)
    }

    /// Drop the locks `owner` holds on `locators`.
    pub fn release_rows(&self, owner: TxnId, locators: &[ChunkLocator]) {
        for locator in locators {
            self.owners.remove_if(locator, |_, lock| lock.owner == owner);
        }
    }

    // ---------------------------------------------------------------------
    // Retrieve locks
    // ---------------------------------------------------------------------

    /// Register that `reader` resolved a version through `writer`.
    pub fn add_retrieve(&self, reader: TxnId, writer: TxnId) {
        if reader == writer {
            return;
        }
        let mut locks = self.retrieve.lock();
        locks.by_writer.entry(writer).or_default().insert(reader);
        locks.by_reader.entry(reader).or_default().insert(writer);
    }

    pub fn has_readers(&self, writer: TxnId) -> bool {
        self.retrieve
            .lock()
            .by_writer
            .get(&writer)
            .is_some_and(|readers| !readers.is_empty())
    }

    /// Writers `reader` holds retrieve locks against
    pub fn writers_of(&self, reader: TxnId) -> Vec<TxnId> {
        let mut writers: Vec<_> = self
            .retrieve
            .lock()
            .by_reader
            .get(&reader)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();
        writers.sort();
        writers
    }

    /// Drop every retrieve lock of `reader`. Writers left without readers
    /// lose their retained versions and hand back their deferred frames.
    pub fn release_reader(&self, reader: TxnId) -> Vec<Released> {
        let freed: Vec<TxnId> = {
            let mut locks = self.retrieve.lock();
            let Some(writers) = locks.by_reader.remove(&reader) else {
                return Vec::new();
            };
            writers
                .into_iter()
                .filter(|writer| match locks.by_writer.get_mut(writer) {
                    Some(readers) => {
                        readers.remove(&reader);
                        if readers.is_empty() {
                            locks.by_writer.remove(writer);
                            true
                        } else {
                            false
                        }
                    }
                    None => true,
                })
                .collect()
        };

        freed
            .into_iter()
            .map(|writer| {
                self.retained.remove(&writer);
                let undo_frames = self.deferred.remove(&writer).map(|(_, f)| f).unwrap_or_default();
                Released { writer, undo_frames }
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Retained versions and deferred frames
    // ---------------------------------------------------------------------

    pub fn retain(&self, writer: TxnId, versions: HashMap<ChunkLocator, RetainedVersion>) {
        if !versions.is_empty() {
            self.retained.insert(writer, versions);
        }
    }

    /// The version `reader` keeps seeing at `locator`, if a writer it
    /// observed has since committed over it.
    pub fn retained_for(&self, reader: TxnId, locator: ChunkLocator) -> Option<RetainedVersion> {
        self.writers_of(reader)
            .into_iter()
            .find_map(|writer| self.retained.get(&writer).and_then(|v| v.get(&locator).copied()))
    }

    /// Retained versions of one table visible to `reader`
    pub fn retained_in(&self, reader: TxnId, table: ObjectId) -> Vec<(ChunkLocator, RetainedVersion)> {
        let mut out = Vec::new();
        for writer in self.writers_of(reader) {
            if let Some(versions) = self.retained.get(&writer) {
                out.extend(
                    versions
                        .iter()
                        .filter(|(_, v)| v.table == table)
                        .map(|(l, v)| (*l, *v)),
                );
            }
        }
        out
    }

    pub fn defer_frames(&self, writer: TxnId, frames: Vec<FrameId>) {
        if !frames.is_empty() {
            self.deferred.entry(writer).or_default().extend(frames);
        }
    }

    pub fn stats(&self) -> LockStats {
        let locks = self.retrieve.lock();
        LockStats {
            row_locks: self.owners.len(),
            retrieve_locks: locks.by_reader.values().map(HashSet::len).sum(),
            retained_writers: self.retained.len(),
            deferred_frames: self.deferred.iter().map(|f| f.len()).sum(),
        }
    }
}
