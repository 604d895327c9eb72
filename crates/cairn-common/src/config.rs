//! Configuration types for Cairn

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Size of the fixed system frame at the start of every data file
pub const SYSTEM_FRAME_SIZE: u64 = 64;

/// Size of the self-describing header at the start of every frame
pub const FRAME_HEADER_SIZE: usize = 64;

/// Largest frame a chunk pointer (u16 offset) can address
pub const MAX_FRAME_SIZE: u32 = 32 * 1024;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node identifier stamped on chains this node starts
    pub node_id: u32,

    /// Directory holding the data files and the header journal
    pub data_dir: PathBuf,

    /// Frame and file layout
    pub storage: StorageConfig,

    /// WaitFrame acquisition policy
    #[serde(default)]
    pub wait: WaitConfig,

    /// Transaction / undo space configuration
    #[serde(default)]
    pub transaction: TransactionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("./data"),
            storage: StorageConfig::default(),
            wait: WaitConfig::default(),
            transaction: TransactionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `data_dir` with default settings.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    /// Fatal errors are returned as `Err(Vec<String>)`.
    /// Warnings are logged but do not cause failure.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let min_frame = (FRAME_HEADER_SIZE + 64) as u32;
        let fs = self.storage.frame_size;
        if fs < min_frame || fs > MAX_FRAME_SIZE {
            errors.push(format!(
                "frame_size must be between {} and {}, got {}",
                min_frame, MAX_FRAME_SIZE, fs
            ));
        }

        let ufs = self.transaction.undo_frame_size;
        if ufs < min_frame || ufs > MAX_FRAME_SIZE {
            errors.push(format!(
                "undo_frame_size must be between {} and {}, got {}",
                min_frame, MAX_FRAME_SIZE, ufs
            ));
        }

        if self.storage.extent_size < fs as u64 {
            errors.push(format!(
                "extent_size ({}) must be at least frame_size ({})",
                self.storage.extent_size, fs
            ));
        }

        if self.storage.partitions == 0 {
            errors.push("partitions must be > 0".to_string());
        }

        if self.transaction.undo_partitions == 0 {
            errors.push("undo_partitions must be > 0".to_string());
        }

        if self.wait.acquire_timeout.is_zero() {
            errors.push("wait.acquire_timeout must be > 0".to_string());
        }

        // Warnings (logged but not fatal)
        if self.wait.poll_interval >= self.wait.acquire_timeout {
            tracing::warn!(
                "wait.poll_interval {:?} is not below acquire_timeout {:?}; slots are polled once",
                self.wait.poll_interval,
                self.wait.acquire_timeout
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Frame and data file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default frame size in bytes for tables that do not override it
    pub frame_size: u32,

    /// Files grow in whole extents of this many bytes
    pub extent_size: u64,

    /// Number of file partitions (and WaitFrame slots) per table
    pub partitions: usize,

    /// fsync data files after every LLT flush
    #[serde(default = "default_sync_on_flush")]
    pub sync_on_flush: bool,
}

fn default_sync_on_flush() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            extent_size: 1024 * 1024,
            partitions: 4,
            sync_on_flush: default_sync_on_flush(),
        }
    }
}

/// WaitFrame acquisition policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Bounded wait before a slot is taken by force
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Initial back-off between polls; doubles up to 8x
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_micros(250),
        }
    }
}

/// Transaction / undo space configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Undo frames pre-allocated per transaction (one per partition)
    pub undo_partitions: usize,

    /// Size of each undo frame
    pub undo_frame_size: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            undo_partitions: 2,
            undo_frame_size: 4096,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level / env-filter directive
    pub level: String,

    /// Log format (json or text)
    pub format: String,

    /// Log file path (None for stdout)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Duration serialization helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
