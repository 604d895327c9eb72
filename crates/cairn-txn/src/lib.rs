//! # Cairn Transactions
//!
//! Transaction layer of the Cairn engine providing:
//! - Undo chunks written to per-transaction undo frames
//! - Row locks with immediate write-conflict detection
//! - Commit and rollback that reconcile every touched frame
//! - Versioned reads through retrieve locks and retained pre-images
//! - Sessions that open their transaction on the first write

pub mod locks;
pub mod manager;
pub mod session;
pub mod trans_frame;
pub mod transaction;
pub mod undo;

// Re-export key types for convenience
pub use locks::{LockRegistry, LockStats, RetainedVersion, RowLock};
pub use manager::{TransactionManager, TxnStats};
pub use session::Session;
pub use trans_frame::TransFrame;
pub use transaction::{Transaction, TxnState};
pub use undo::{read_undo, UndoChunk, UndoLog, UndoRef};

use cairn_common::prelude::*;

/// Hook run for every committed transaction, used to broadcast the frames
/// it changed to other nodes. A failing listener is logged and does not
/// undo the commit.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, txn: &Transaction, frames: &[FrameId]) -> Result<()>;
}
