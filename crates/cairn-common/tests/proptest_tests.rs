//! Property-based tests for Cairn common types
//!
//! Uses proptest to verify invariants across randomized inputs:
//! - Frame ids and chunk locators survive their packed encodings
//! - Error classification is total and consistent with recoverability
//! - Config serialization round-trips correctly

use std::time::Duration;

use cairn_common::config::{EngineConfig, StorageConfig, WaitConfig};
use cairn_common::error::*;
use cairn_common::types::*;
use proptest::prelude::*;

// ============================================================================
// Addressing Properties
// ============================================================================

proptest! {
    /// Any 16-bit file id and 48-bit pointer survive the combined form
    #[test]
    fn frame_id_combined_round_trip(file in 0u32..=u16::MAX as u32, pointer in 0u64..(1u64 << 48)) {
        let id = FrameId::new(FileId(file), pointer);
        prop_assert_eq!(FrameId::from_u64(id.to_u64()), id);
    }

    /// Locators survive their 10-byte encoding
    #[test]
    fn locator_encoding_is_lossless(
        file in 0u32..1024,
        pointer in 64u64..(1u64 << 40),
        chunk in any::<u16>(),
    ) {
        let loc = ChunkLocator::new(FrameId::new(FileId(file), pointer), chunk);
        let bytes = loc.encode();
        prop_assert_eq!(bytes.len(), LOCATOR_SIZE);
        prop_assert_eq!(ChunkLocator::decode(&bytes), Some(loc));
    }

    /// Only a zero pointer is the null link
    #[test]
    fn null_link_iff_zero_pointer(file in any::<u16>(), pointer in any::<u32>()) {
        let id = FrameId::new(FileId(file as u32), pointer as u64);
        prop_assert_eq!(id.link().is_none(), pointer == 0);
    }
}

// ============================================================================
// Error Classification Properties
// ============================================================================

/// Generate an arbitrary Error variant
fn arbitrary_error() -> impl Strategy<Value = Error> {
    prop_oneof![
        any::<String>().prop_map(|s| Error::Storage(StorageError::FileNotFound(s))),
        (any::<u16>(), any::<u16>()).prop_map(|(expected, found)| Error::Storage(
            StorageError::VersionMismatch { expected, found }
        )),
        any::<String>().prop_map(|s| Error::Storage(StorageError::CorruptHeader(s))),
        any::<u64>().prop_map(|n| Error::Storage(StorageError::FrameNotFound(n))),
        (any::<u64>(), any::<String>()).prop_map(|(frame, reason)| Error::corrupted(frame, reason)),
        any::<String>().prop_map(|s| Error::Storage(StorageError::ConsistencyFault(s))),
        any::<String>().prop_map(|s| Error::Storage(StorageError::JournalCorrupted(s))),
        any::<String>().prop_map(|s| Error::Storage(StorageError::DeletedRecord(s))),
        (any::<usize>(), any::<usize>()).prop_map(|(needed, available)| Error::Storage(
            StorageError::InsufficientSpace { needed, available }
        )),
        any::<String>().prop_map(|s| Error::Storage(StorageError::DuplicateKey(s))),
        any::<String>().prop_map(|s| Error::Storage(StorageError::IoError(s))),
        any::<u64>().prop_map(|n| Error::Transaction(TransactionError::NotFound(n))),
        any::<u64>().prop_map(|n| Error::Transaction(TransactionError::AlreadyCommitted(n))),
        any::<u64>().prop_map(|n| Error::Transaction(TransactionError::AlreadyRolledBack(n))),
        (any::<String>(), any::<u64>()).prop_map(|(locator, holder)| Error::Transaction(
            TransactionError::WriteConflict { locator, holder }
        )),
        any::<u64>().prop_map(|n| Error::Transaction(TransactionError::ReadOnly(n))),
        any::<String>().prop_map(Error::Internal),
        (any::<String>(), any::<String>()).prop_map(|(a, b)| Error::NotFound(a, b)),
        any::<String>().prop_map(Error::InvalidArgument),
        any::<String>().prop_map(Error::Timeout),
        any::<String>().prop_map(Error::Config),
        any::<String>().prop_map(Error::Serialization),
    ]
}

proptest! {
    /// Corruption is always a structural or file-level failure
    #[test]
    fn corruption_is_never_recoverable(error in arbitrary_error()) {
        if error.is_corruption() {
            prop_assert!(!error.is_recoverable(), "corruption marked recoverable: {:?}", error);
            prop_assert!(
                matches!(error.class(), ErrorClass::Structural | ErrorClass::FileLevel),
                "corruption classified as {:?}", error.class()
            );
        }
    }

    /// Record-level errors are recoverable
    #[test]
    fn record_class_is_recoverable(error in arbitrary_error()) {
        if error.class() == ErrorClass::Record {
            prop_assert!(error.is_recoverable());
        }
    }

    /// Every error renders a non-empty message
    #[test]
    fn display_is_non_empty(error in arbitrary_error()) {
        prop_assert!(!error.to_string().is_empty());
    }
}

// ============================================================================
// Config Serialization Properties
// ============================================================================

proptest! {
    /// EngineConfig serialization round-trip: default config survives toml round-trip
    #[test]
    fn config_default_round_trip(_dummy in 0..1u32) {
        let config = EngineConfig::default();
        let serialized = toml::to_string(&config).expect("Failed to serialize default config");
        let deserialized: EngineConfig = toml::from_str(&serialized)
            .expect("Failed to deserialize config");

        prop_assert_eq!(config.node_id, deserialized.node_id);
        prop_assert_eq!(config.data_dir, deserialized.data_dir);
        prop_assert_eq!(config.storage.frame_size, deserialized.storage.frame_size);
        prop_assert_eq!(config.transaction.undo_partitions, deserialized.transaction.undo_partitions);
    }

    /// StorageConfig round-trips for any layout
    #[test]
    fn storage_config_round_trip(
        frame_size in 128u32..=32768,
        extents in 1u64..64,
        partitions in 1usize..16,
    ) {
        let config = StorageConfig {
            frame_size,
            extent_size: frame_size as u64 * extents,
            partitions,
            sync_on_flush: false,
        };
        let serialized = toml::to_string(&config).expect("Failed to serialize storage config");
        let deserialized: StorageConfig = toml::from_str(&serialized)
            .expect("Failed to deserialize storage config");

        prop_assert_eq!(config.frame_size, deserialized.frame_size);
        prop_assert_eq!(config.extent_size, deserialized.extent_size);
        prop_assert_eq!(config.partitions, deserialized.partitions);
        prop_assert_eq!(config.sync_on_flush, deserialized.sync_on_flush);
    }

    /// Durations survive the humantime representation
    #[test]
    fn wait_config_round_trip(timeout_ms in 1u64..10_000, poll_us in 1u64..10_000) {
        let config = WaitConfig {
            acquire_timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_micros(poll_us),
        };
        let serialized = toml::to_string(&config).expect("Failed to serialize wait config");
        let deserialized: WaitConfig = toml::from_str(&serialized)
            .expect("Failed to deserialize wait config");

        prop_assert_eq!(config.acquire_timeout, deserialized.acquire_timeout);
        prop_assert_eq!(config.poll_interval, deserialized.poll_interval);
    }

    /// Any frame size inside the supported range validates
    #[test]
    fn valid_layouts_pass_validation(frame_size in 128u32..=32768) {
        let mut config = EngineConfig::default();
        config.storage.frame_size = frame_size;
        config.storage.extent_size = frame_size as u64 * 16;
        prop_assert!(config.validate().is_ok());
    }
}
