//! Journal-backed context store.

use crate::error::StoreError;
use crate::rows::{MachineRecord, Tables};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use wakestate_journal::{FsyncPolicy, Journal, JournalConfig, JournalEntry};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the journal.
    pub dir: PathBuf,
    /// Fsync policy for row writes.
    pub fsync_policy: FsyncPolicy,
    /// Compact once the journal holds this many records more than there are
    /// live rows (0 = never compact automatically).
    pub compact_after: u64,
}

impl StoreConfig {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            fsync_policy: FsyncPolicy::EveryWrite,
            compact_after: 4096,
        }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn with_compact_after(mut self, records: u64) -> Self {
        self.compact_after = records;
        self
    }
}

/// Row write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub context_writes: u64,
    pub timer_writes: u64,
    pub timer_deletes: u64,
    pub field_writes: u64,
    pub field_deletes: u64,
    pub wipes: u64,
    pub compactions: u64,
}

/// Result of a compaction operation.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// Records in the journal before compaction.
    pub records_before: u64,
    /// Records after compaction (one per live row).
    pub records_after: u64,
    /// Size of the rewritten journal in bytes.
    pub bytes_after: u64,
}

/// Durable, row-oriented store for machine contexts.
///
/// All writers go through the engine's single pump thread, so the store only
/// needs short critical sections to keep the in-memory tables and the
/// journal in step.
pub struct ContextStore {
    config: StoreConfig,
    journal: Journal,
    tables: RwLock<Tables>,
    context_writes: AtomicU64,
    timer_writes: AtomicU64,
    timer_deletes: AtomicU64,
    field_writes: AtomicU64,
    field_deletes: AtomicU64,
    wipes: AtomicU64,
    compactions: AtomicU64,
}

impl ContextStore {
    /// Opens or creates the store, replaying the journal into memory.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.dir)?;

        let journal = Journal::open(
            JournalConfig::new(&config.dir).with_fsync_policy(config.fsync_policy),
        )?;

        let mut tables = Tables::default();
        for (_, entry) in journal.read_all()? {
            tables.apply(&entry);
        }

        tracing::info!(
            "Context store opened at {}: {} machine types, {} rows",
            config.dir.display(),
            tables.machines().count(),
            tables.row_count()
        );

        Ok(Self {
            config,
            journal,
            tables: RwLock::new(tables),
            context_writes: AtomicU64::new(0),
            timer_writes: AtomicU64::new(0),
            timer_deletes: AtomicU64::new(0),
            field_writes: AtomicU64::new(0),
            field_deletes: AtomicU64::new(0),
            wipes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        })
    }

    /// Returns the durable record of a machine type, if a context row exists.
    pub fn load(&self, machine: &str) -> Option<MachineRecord> {
        self.tables
            .read()
            .get(machine)
            .filter(|record| record.context.is_some())
            .cloned()
    }

    /// Returns every stored machine type name.
    pub fn machines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().machines().map(|(k, _)| k.clone()).collect();
        names.sort();
        names
    }

    /// Inserts or updates the context row.
    pub fn put_context(&self, machine: &str, state: i32) -> Result<(), StoreError> {
        self.write(JournalEntry::PutContext {
            machine: machine.to_string(),
            state,
            timestamp: 0,
        })?;
        self.context_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Inserts or updates one timer row.
    pub fn put_timer(&self, machine: &str, timer: &str, deadline: i64) -> Result<(), StoreError> {
        self.write(JournalEntry::PutTimer {
            machine: machine.to_string(),
            timer: timer.to_string(),
            deadline,
        })?;
        self.timer_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes one timer row.
    pub fn delete_timer(&self, machine: &str, timer: &str) -> Result<(), StoreError> {
        self.write(JournalEntry::DeleteTimer {
            machine: machine.to_string(),
            timer: timer.to_string(),
        })?;
        self.timer_deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Inserts or updates one field row.
    pub fn put_field(&self, machine: &str, field: &str, value: String) -> Result<(), StoreError> {
        self.write(JournalEntry::PutField {
            machine: machine.to_string(),
            field: field.to_string(),
            value,
        })?;
        self.field_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes one field row.
    pub fn delete_field(&self, machine: &str, field: &str) -> Result<(), StoreError> {
        self.write(JournalEntry::DeleteField {
            machine: machine.to_string(),
            field: field.to_string(),
        })?;
        self.field_deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes every row of a machine type in one journal record.
    pub fn wipe(&self, machine: &str) -> Result<(), StoreError> {
        self.write(JournalEntry::WipeMachine {
            machine: machine.to_string(),
        })?;
        self.wipes.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Wiped durable record for machine {}", machine);
        Ok(())
    }

    fn write(&self, entry: JournalEntry) -> Result<(), StoreError> {
        self.journal.append(&entry)?;
        self.tables.write().apply(&entry);
        self.maybe_compact();
        Ok(())
    }

    fn maybe_compact(&self) {
        if self.config.compact_after == 0 {
            return;
        }
        let live = self.tables.read().row_count() as u64;
        let records = self.journal.record_count();
        if records.saturating_sub(live) < self.config.compact_after {
            return;
        }
        if let Err(e) = self.compact() {
            tracing::error!("Automatic store compaction failed: {}", e);
        }
    }

    /// Rewrites the journal as one record per live row.
    pub fn compact(&self) -> Result<CompactionResult, StoreError> {
        let tables = self.tables.read();
        let mut entries = Vec::with_capacity(tables.row_count());
        let mut names: Vec<&String> = tables.machines().map(|(k, _)| k).collect();
        names.sort();
        for name in names {
            if let Some(record) = tables.get(name) {
                entries.extend(record.to_entries(name));
            }
        }

        let records_before = self.journal.record_count();
        let bytes_after = self.journal.rewrite(&entries)?;
        drop(tables);

        self.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Compacted context journal: {} -> {} records",
            records_before,
            entries.len()
        );

        Ok(CompactionResult {
            records_before,
            records_after: entries.len() as u64,
            bytes_after,
        })
    }

    /// Syncs the journal to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.journal.sync()?;
        Ok(())
    }

    /// Returns the number of journal records.
    pub fn journal_records(&self) -> u64 {
        self.journal.record_count()
    }

    /// Returns row write counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            context_writes: self.context_writes.load(Ordering::Relaxed),
            timer_writes: self.timer_writes.load(Ordering::Relaxed),
            timer_deletes: self.timer_deletes.load(Ordering::Relaxed),
            field_writes: self.field_writes.load(Ordering::Relaxed),
            field_deletes: self.field_deletes.load(Ordering::Relaxed),
            wipes: self.wipes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}
