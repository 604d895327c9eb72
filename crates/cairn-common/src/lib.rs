//! # Cairn Common
//!
//! Identifiers, errors, configuration and logging shared by every Cairn crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod testing;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{Error, ErrorClass, Result};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, ErrorClass, Result, StorageError, TransactionError};
    pub use super::types::*;
    pub use bytes::Bytes;
    pub use tracing::{debug, error, info, trace, warn};
}
