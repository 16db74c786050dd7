//! # wakestate-journal
//!
//! Append-only journal backing the wakestate context store.
//!
//! This crate provides:
//! - Per-record CRC32C checksums for corruption detection
//! - Configurable fsync policies
//! - Recovery from torn writes (truncation at the last valid record)
//! - Atomic rewrite for compaction

pub mod entry;
pub mod error;
pub mod journal;

pub use entry::{JournalEntry, JournalEntryType, JournalRecord};
pub use error::JournalError;
pub use journal::{FsyncPolicy, Journal, JournalConfig, JournalStats, RecoveryReport};

/// Journal record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 21;

/// Default journal file name inside the journal directory.
pub const JOURNAL_FILE_NAME: &str = "context.journal";
