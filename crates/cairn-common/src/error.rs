//! Error types for Cairn

use thiserror::Error;

/// Result type alias using Cairn's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cairn
#[derive(Error, Debug)]
pub enum Error {
    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Transaction errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Not found
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    // File level
    #[error("Data file not found: {0}")]
    FileNotFound(String),

    #[error("Data file version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("Corrupt data file header: {0}")]
    CorruptHeader(String),

    // Structural consistency
    #[error("Frame not found: {0:#x}")]
    FrameNotFound(u64),

    #[error("Frame {frame:#x} corrupted: {reason}")]
    FrameCorrupted { frame: u64, reason: String },

    #[error("Internal consistency fault: {0}")]
    ConsistencyFault(String),

    #[error("Header journal corrupted: {0}")]
    JournalCorrupted(String),

    // Record level
    #[error("Record deleted: {0}")]
    DeletedRecord(String),

    #[error("Insufficient space: needed {needed} bytes, available {available}")]
    InsufficientSpace { needed: usize, available: usize },

    #[error("Duplicate key in unique index {0}")]
    DuplicateKey(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction not found: {0}")]
    NotFound(u64),

    #[error("Transaction already committed: {0}")]
    AlreadyCommitted(u64),

    #[error("Transaction already rolled back: {0}")]
    AlreadyRolledBack(u64),

    #[error("Write conflict on {locator}: held by transaction {holder}")]
    WriteConflict { locator: String, holder: u64 },

    #[error("Transaction {0} is read-only")]
    ReadOnly(u64),
}

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// File open/validation problems, surfaced to the bootstrap layer
    FileLevel,
    /// Internal consistency fault; aborts the current operation
    Structural,
    /// Local, recoverable condition on a single record
    Record,
    /// Everything else (I/O, configuration, lifecycle misuse)
    Other,
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(kind.into(), name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Internal-consistency fault (corruption or programmer error).
    pub fn consistency(msg: impl Into<String>) -> Self {
        Error::Storage(StorageError::ConsistencyFault(msg.into()))
    }

    pub fn frame_not_found(frame: u64) -> Self {
        Error::Storage(StorageError::FrameNotFound(frame))
    }

    pub fn corrupted(frame: u64, reason: impl Into<String>) -> Self {
        Error::Storage(StorageError::FrameCorrupted {
            frame,
            reason: reason.into(),
        })
    }

    /// Classify this error into the engine's failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Storage(se) => match se {
                StorageError::FileNotFound(_)
                | StorageError::VersionMismatch { .. }
                | StorageError::CorruptHeader(_) => ErrorClass::FileLevel,
                StorageError::FrameNotFound(_)
                | StorageError::FrameCorrupted { .. }
                | StorageError::ConsistencyFault(_)
                | StorageError::JournalCorrupted(_) => ErrorClass::Structural,
                StorageError::DeletedRecord(_)
                | StorageError::InsufficientSpace { .. }
                | StorageError::DuplicateKey(_) => ErrorClass::Record,
                StorageError::IoError(_) => ErrorClass::Other,
            },
            Error::Transaction(TransactionError::WriteConflict { .. })
            | Error::Transaction(TransactionError::ReadOnly(_)) => ErrorClass::Record,
            Error::Internal(_) => ErrorClass::Structural,
            _ => ErrorClass::Other,
        }
    }

    /// Whether the caller may retry or continue after this error.
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Record || matches!(self, Error::Timeout(_))
    }

    /// Whether this error indicates on-disk or in-memory corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Storage(StorageError::FrameCorrupted { .. })
                | Error::Storage(StorageError::CorruptHeader(_))
                | Error::Storage(StorageError::JournalCorrupted(_))
        )
    }
}
