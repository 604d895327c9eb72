//! # Cairn Storage
//!
//! Storage layer of the Cairn engine providing:
//! - Data files carved into fixed-size frames, with a free list for reuse
//! - Tables as doubly-linked frame chains with per-partition append slots
//! - B+tree indexes whose pages are frames of an index table
//! - LLT header batches made crash-atomic by a small header journal
//! - Frame replication messages for remote nodes

pub mod chunk;
pub mod data_frame;
pub mod datafile;
pub mod engine;
pub mod frame;
pub mod free_list;
pub mod index;
pub mod index_frame;
pub mod journal;
pub mod llt;
pub mod sync;
pub mod table;
pub mod wait_frame;

// Re-export key types for convenience
pub use chunk::{decode_id, encode_id, BytesColumn, Chunk, Decodable, Encodable, IdColumn, KeyExtractor};
pub use data_frame::{ChunkRecord, DataFrame, CHUNK_HEADER_SIZE};
pub use datafile::{Allocation, DataFile, FileStatus, SystemHeader};
pub use engine::{EngineStats, StorageEngine};
pub use frame::{frame_flags, Frame, FrameData, FrameHeader, FrameKind};
pub use free_list::{FreeFrame, FreeList};
pub use index::TreeReport;
pub use index_frame::{IndexEntry, IndexFrame, SplitChunk};
pub use journal::HeaderJournal;
pub use llt::Llt;
pub use sync::FrameSync;
pub use table::{Chain, ChainReport, Table, TableKind, TableOptions};
pub use wait_frame::{WaitFrame, WaitFrames, WaitGuard};

use std::sync::Arc;

use cairn_common::prelude::*;

/// Pre-image of a chunk, handed to the [`WriteTracker`] before the chunk is
/// changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoImage {
    /// The chunk did not exist; undo removes it
    Absent,
    /// The chunk existed with this state and payload; undo writes it back
    Row {
        state: ChunkState,
        owner: ObjectId,
        payload: Bytes,
    },
    /// A key was inserted into an index; undo removes it
    IndexInsert { key: Bytes, row: ChunkLocator },
    /// A key was removed from an index; undo inserts it again
    IndexRemove { key: Bytes, row: ChunkLocator },
}

impl UndoImage {
    /// Index images are logical and never take an owner lock.
    pub fn is_index(&self) -> bool {
        matches!(self, UndoImage::IndexInsert { .. } | UndoImage::IndexRemove { .. })
    }
}

/// Hook through which table mutations report to the enclosing transaction.
///
/// Transactional tables call [`WriteTracker::lock_chunk`] with the chunk's
/// pre-image while the frame content lock is held and before the chunk is
/// changed; an error aborts the mutation untouched. Size changes are
/// reported through [`WriteTracker::store_frame`] and applied at commit.
pub trait WriteTracker: Send + Sync {
    /// Transaction the changes belong to
    fn txn_id(&self) -> TxnId;

    /// Take the owner lock on `locator` and record its pre-image.
    fn lock_chunk(
        &self,
        engine: &StorageEngine,
        table: &Table,
        frame: &Arc<FrameData>,
        locator: ChunkLocator,
        image: UndoImage,
    ) -> Result<()>;

    /// Register `frame` as touched, with an optional undo frame and a
    /// pending change to its `used` counter.
    fn store_frame(
        &self,
        engine: &StorageEngine,
        frame: &Arc<FrameData>,
        undo: Option<FrameId>,
        delta: i64,
    ) -> Result<()>;
}
