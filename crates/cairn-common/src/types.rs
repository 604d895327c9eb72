//! Core identifier and state types for Cairn

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, StorageError};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a data file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// Identifier of a table (data or index); also stamped into every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Identifier of a node that originated a frame chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Stable frame identity that survives eviction and reload of the frame content
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocId(pub u64);

impl ObjectId {
    /// Owner stamped on undo frames; never a user table.
    pub const UNDO: ObjectId = ObjectId(u32::MAX);
}

impl TxnId {
    pub const INVALID: TxnId = TxnId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl NodeId {
    /// Marker for "not a remote chain start"
    pub const LOCAL: NodeId = NodeId(0);
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

// ============================================================================
// Frame addressing
// ============================================================================

const POINTER_BITS: u32 = 48;
const POINTER_MASK: u64 = (1 << POINTER_BITS) - 1;

/// Frame identity: owning file plus the byte offset of the frame inside it.
///
/// Pointer 0 always addresses the system frame, so `(0, 0)` doubles as the
/// null link in chain pointers, which is also the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId {
    pub file: FileId,
    pub pointer: u64,
}

impl FrameId {
    pub const NONE: FrameId = FrameId {
        file: FileId(0),
        pointer: 0,
    };

    pub fn new(file: FileId, pointer: u64) -> Self {
        Self { file, pointer }
    }

    pub fn is_none(&self) -> bool {
        self.pointer == 0
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Combined `frameId` form: file id in the top 16 bits, pointer below.
    pub fn to_u64(&self) -> u64 {
        ((self.file.0 as u64) << POINTER_BITS) | (self.pointer & POINTER_MASK)
    }

    pub fn from_u64(val: u64) -> Self {
        Self {
            file: FileId((val >> POINTER_BITS) as u32),
            pointer: val & POINTER_MASK,
        }
    }

    /// `Some(self)` unless this is the null link.
    pub fn link(self) -> Option<FrameId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.0, self.pointer)
    }
}

/// Physical location of a chunk: (file, frame, pointer-within-frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkLocator {
    pub frame: FrameId,
    pub pointer: u16,
}

/// Encoded size of a locator inside index entries and undo records
pub const LOCATOR_SIZE: usize = 10;

impl ChunkLocator {
    pub fn new(frame: FrameId, pointer: u16) -> Self {
        Self { frame, pointer }
    }

    pub fn encode(&self) -> [u8; LOCATOR_SIZE] {
        let mut out = [0u8; LOCATOR_SIZE];
        out[..8].copy_from_slice(&self.frame.to_u64().to_le_bytes());
        out[8..].copy_from_slice(&self.pointer.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < LOCATOR_SIZE {
            return None;
        }
        let mut frame = [0u8; 8];
        frame.copy_from_slice(&data[..8]);
        Some(Self {
            frame: FrameId::from_u64(u64::from_le_bytes(frame)),
            pointer: u16::from_le_bytes([data[8], data[9]]),
        })
    }
}

impl fmt::Display for ChunkLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.frame, self.pointer)
    }
}

// ============================================================================
// States
// ============================================================================

/// Row state carried in every chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkState {
    Normal = 0,
    Deleted = 1,
    Archived = 2,
}

impl TryFrom<u8> for ChunkState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(ChunkState::Normal),
            1 => Ok(ChunkState::Deleted),
            2 => Ok(ChunkState::Archived),
            other => Err(Error::Storage(StorageError::ConsistencyFault(format!(
                "invalid chunk state {}",
                other
            )))),
        }
    }
}

/// Transaction isolation flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionType {
    /// Sees the latest committed version of every chunk
    #[default]
    ReadCommitted,
    /// Keeps seeing versions it observed, even after their writers commit
    Serializable,
    /// Read-only snapshot pinned at begin; writes are rejected
    Fixed,
}

impl TransactionType {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionType::Fixed)
    }

    pub fn stamps_sequence(&self) -> bool {
        matches!(self, TransactionType::Serializable | TransactionType::Fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_combined_form() {
        let id = FrameId::new(FileId(3), 4096 + 256);
        let restored = FrameId::from_u64(id.to_u64());
        assert_eq!(restored, id);
        assert_eq!(id.to_u64() >> 48, 3);
    }

    #[test]
    fn test_frame_id_none() {
        assert!(FrameId::NONE.is_none());
        assert_eq!(FrameId::NONE.link(), None);
        assert!(FrameId::new(FileId(0), 64).is_some());
        assert_eq!(FrameId::default(), FrameId::NONE);
    }

    #[test]
    fn test_locator_encoding() {
        let loc = ChunkLocator::new(FrameId::new(FileId(1), 320), 72);
        let decoded = ChunkLocator::decode(&loc.encode()).unwrap();
        assert_eq!(decoded, loc);
        assert!(ChunkLocator::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn test_chunk_state_from_u8() {
        assert_eq!(ChunkState::try_from(1).unwrap(), ChunkState::Deleted);
        assert!(ChunkState::try_from(9).is_err());
    }

    #[test]
    fn test_transaction_type() {
        assert!(TransactionType::Fixed.is_read_only());
        assert!(TransactionType::Serializable.stamps_sequence());
        assert!(!TransactionType::ReadCommitted.stamps_sequence());
    }
}
