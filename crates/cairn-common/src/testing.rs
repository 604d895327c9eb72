//! Testing utilities and fixtures

use crate::config::EngineConfig;
use std::path::PathBuf;
use tempfile::TempDir;

/// Test context with automatic cleanup
pub struct TestContext {
    pub temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.temp_dir.path().join("data")
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Engine configuration rooted in this context with the given layout.
    pub fn engine_config(&self, frame_size: u32, extent_size: u64, partitions: usize) -> EngineConfig {
        let mut config = EngineConfig::with_data_dir(self.data_dir());
        config.storage.frame_size = frame_size;
        config.storage.extent_size = extent_size;
        config.storage.partitions = partitions;
        config.storage.sync_on_flush = false;
        config.transaction.undo_frame_size = frame_size.max(512);
        config
    }

    /// Small layout used by most tests: 256-byte frames, 4 KiB extents.
    pub fn small_config(&self) -> EngineConfig {
        self.engine_config(256, 4096, 1)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Test fixtures for common scenarios
pub mod fixtures {
    /// Row payload of `len` bytes whose first 8 bytes are `id` (little endian).
    pub fn row(id: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.max(8));
        out.extend_from_slice(&id.to_le_bytes());
        let mut seed = id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        while out.len() < len {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            out.push(seed as u8);
        }
        out
    }

    /// `count` rows with ids `0..count`.
    pub fn rows(count: usize, len: usize) -> Vec<Vec<u8>> {
        (0..count as u64).map(|i| row(i, len)).collect()
    }

    /// Fixed-width big-endian key, so byte order equals numeric order.
    pub fn key(id: u64) -> Vec<u8> {
        id.to_be_bytes().to_vec()
    }
}
