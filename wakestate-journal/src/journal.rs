//! Journal file management.

use crate::entry::{JournalEntry, JournalRecord};
use crate::error::JournalError;
use crate::{JOURNAL_FILE_NAME, RECORD_HEADER_SIZE};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fsync policy for journal writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    #[default]
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Never fsync automatically (caller must call sync).
    Never,
}

/// Journal configuration.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the journal file.
    pub dir: PathBuf,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    /// Returns the path of the journal file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE_NAME)
    }
}

/// What recovery found when the journal was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Bytes cut off the tail (torn write or corruption).
    pub bytes_truncated: u64,
    /// Maximum sequence number found.
    pub max_sequence: u64,
}

/// I/O statistics for the journal.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalStats {
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total append operations.
    pub writes: u64,
    /// Total fsync operations.
    pub fsyncs: u64,
    /// Records currently in the file.
    pub records: u64,
    /// Current file size.
    pub size: u64,
}

struct JournalFile {
    file: File,
    size: u64,
    records: u64,
    sync_pending: bool,
}

impl JournalFile {
    /// Writes `bytes` at the logical end of the journal. A failed write is
    /// cut back off, and any bytes left past the logical end are overwritten
    /// by the next append, so a torn record never precedes valid ones.
    fn write_at_end(&mut self, bytes: &[u8]) -> Result<(), JournalError> {
        self.file.seek(SeekFrom::Start(self.size))?;
        if let Err(e) = self.file.write_all(bytes) {
            if let Err(trim) = self.file.set_len(self.size) {
                tracing::error!("Failed to trim torn journal write: {}", trim);
            }
            return Err(e.into());
        }
        self.size += bytes.len() as u64;
        self.records += 1;
        self.sync_pending = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
        }
        Ok(())
    }
}

/// Single-file append-only journal.
pub struct Journal {
    config: JournalConfig,
    file: Mutex<JournalFile>,
    recovery: RecoveryReport,
    next_sequence: AtomicU64,
    writes_since_sync: AtomicU64,
    closed: AtomicBool,
    stats_bytes_written: AtomicU64,
    stats_writes: AtomicU64,
    stats_fsyncs: AtomicU64,
}

impl Journal {
    /// Opens or creates the journal, truncating any torn or corrupt tail.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        std::fs::create_dir_all(&config.dir)?;
        let path = config.path();

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let recovery = scan(&mut file)?;
        let valid_end = file_size - recovery.bytes_truncated;

        if recovery.bytes_truncated > 0 {
            tracing::warn!(
                "Journal {}: truncating {} bytes after last valid record",
                path.display(),
                recovery.bytes_truncated
            );
            file.set_len(valid_end)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;

        tracing::info!(
            "Journal recovered: {} records, next_sequence={}",
            recovery.valid_records,
            recovery.max_sequence + 1
        );

        Ok(Self {
            file: Mutex::new(JournalFile {
                file,
                size: valid_end,
                records: recovery.valid_records,
                sync_pending: false,
            }),
            next_sequence: AtomicU64::new(recovery.max_sequence + 1),
            recovery,
            config,
            writes_since_sync: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stats_bytes_written: AtomicU64::new(0),
            stats_writes: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
        })
    }

    /// Returns what recovery found when the journal was opened.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Appends an entry. Returns its sequence number.
    pub fn append(&self, entry: &JournalEntry) -> Result<u64, JournalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::Closed);
        }

        let mut file = self.file.lock();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = JournalRecord::from_entry(entry, sequence)?;
        let encoded = record.encode()?;

        file.write_at_end(&encoded)?;

        self.stats_bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        self.stats_writes.fetch_add(1, Ordering::Relaxed);

        let writes = self.writes_since_sync.fetch_add(1, Ordering::Relaxed) + 1;
        match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => self.sync_locked(&mut file)?,
            FsyncPolicy::EveryN(n) if writes >= n as u64 => self.sync_locked(&mut file)?,
            _ => {}
        }

        Ok(sequence)
    }

    /// Forces a sync to disk.
    pub fn sync(&self) -> Result<(), JournalError> {
        let mut file = self.file.lock();
        self.sync_locked(&mut file)
    }

    fn sync_locked(&self, file: &mut JournalFile) -> Result<(), JournalError> {
        if file.sync_pending {
            file.sync()?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        self.writes_since_sync.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Reads every entry in append order.
    pub fn read_all(&self) -> Result<Vec<(u64, JournalEntry)>, JournalError> {
        let mut file = self.file.lock();
        file.file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::with_capacity(file.size as usize);
        (&file.file).take(file.size).read_to_end(&mut data)?;
        file.file.seek(SeekFrom::End(0))?;
        drop(file);

        let mut buf = BytesMut::from(&data[..]);
        let mut offset = 0u64;
        let mut entries = Vec::new();
        while buf.len() >= RECORD_HEADER_SIZE {
            match JournalRecord::decode(&mut buf, offset)? {
                Some(record) => {
                    offset += record.disk_size() as u64;
                    entries.push((record.header.sequence, record.entry()?));
                }
                None => break,
            }
        }
        Ok(entries)
    }

    /// Atomically replaces the journal contents with `entries`.
    ///
    /// The new contents are written to a temporary file, synced, and renamed
    /// over the journal, so a crash leaves either the old or the new file.
    pub fn rewrite(&self, entries: &[JournalEntry]) -> Result<u64, JournalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::Closed);
        }

        let path = self.config.path();
        let tmp_path = path.with_extension("journal.compact");

        let mut file = self.file.lock();
        let mut buf = BytesMut::new();
        for entry in entries {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let record = JournalRecord::from_entry(entry, sequence)?;
            buf.extend_from_slice(&record.encode()?);
        }

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        sync_dir(&self.config.dir);

        let mut reopened = OpenOptions::new().read(true).write(true).open(&path)?;
        reopened.seek(SeekFrom::End(0))?;
        *file = JournalFile {
            file: reopened,
            size: buf.len() as u64,
            records: entries.len() as u64,
            sync_pending: false,
        };
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        self.writes_since_sync.store(0, Ordering::Relaxed);

        Ok(buf.len() as u64)
    }

    /// Closes the journal.
    pub fn close(&self) -> Result<(), JournalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    /// Returns the number of records currently in the file.
    pub fn record_count(&self) -> u64 {
        self.file.lock().records
    }

    /// Returns the next sequence number that will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Returns the path of the journal file.
    pub fn path(&self) -> PathBuf {
        self.config.path()
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> JournalStats {
        let file = self.file.lock();
        JournalStats {
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            writes: self.stats_writes.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            records: file.records,
            size: file.size,
        }
    }
}

/// Scans the file from the start and reports where valid data ends.
fn scan(file: &mut File) -> Result<RecoveryReport, JournalError> {
    file.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let total = data.len() as u64;

    let mut report = RecoveryReport::default();
    let mut buf = BytesMut::from(&data[..]);
    let mut offset = 0u64;

    while buf.len() >= RECORD_HEADER_SIZE {
        match JournalRecord::decode(&mut buf, offset) {
            Ok(Some(record)) => {
                report.valid_records += 1;
                report.max_sequence = report.max_sequence.max(record.header.sequence);
                offset += record.disk_size() as u64;
            }
            Ok(None) => break,
            Err(e) if e.is_corruption() || matches!(e, JournalError::RecordTooLarge { .. }) => {
                tracing::warn!("Journal scan stopped at offset {}: {}", offset, e);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    report.bytes_truncated = total - offset;
    Ok(report)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> JournalConfig {
        JournalConfig::new(dir).with_fsync_policy(FsyncPolicy::EveryWrite)
    }

    fn put_field(field: &str, value: &str) -> JournalEntry {
        JournalEntry::PutField {
            machine: "tracker".to_string(),
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(test_config(dir.path())).unwrap();

        let seq = journal.append(&put_field("a", "1")).unwrap();
        assert_eq!(seq, 1);

        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, put_field("a", "1"));
        assert_eq!(journal.record_count(), 1);
    }

    #[test]
    fn test_reopen_preserves_records_and_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(test_config(dir.path())).unwrap();
            for i in 0..10 {
                journal.append(&put_field("a", &i.to_string())).unwrap();
            }
            journal.close().unwrap();
        }

        let journal = Journal::open(test_config(dir.path())).unwrap();
        assert_eq!(journal.next_sequence(), 11);
        assert_eq!(journal.recovery().valid_records, 10);
        assert_eq!(journal.read_all().unwrap().len(), 10);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = {
            let journal = Journal::open(test_config(dir.path())).unwrap();
            journal.append(&put_field("a", "1")).unwrap();
            journal.append(&put_field("b", "2")).unwrap();
            journal.path()
        };

        // Simulate a crash halfway through a third record
        let record = JournalRecord::from_entry(&put_field("c", "3"), 3).unwrap();
        let encoded = record.encode().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&encoded[..encoded.len() / 2]).unwrap();
        drop(file);

        let journal = Journal::open(test_config(dir.path())).unwrap();
        let report = journal.recovery();
        assert_eq!(report.valid_records, 2);
        assert_eq!(report.bytes_truncated, (encoded.len() / 2) as u64);

        // Appends continue cleanly after the truncation point
        journal.append(&put_field("c", "3")).unwrap();
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].1, put_field("c", "3"));
    }

    #[test]
    fn test_bytes_past_logical_end_are_overwritten() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(test_config(dir.path())).unwrap();
        journal.append(&put_field("a", "1")).unwrap();

        // Half a record left behind by a write that failed midway.
        let record = JournalRecord::from_entry(&put_field("b", "2"), 2).unwrap();
        let encoded = record.encode().unwrap();
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(&encoded[..encoded.len() / 2]).unwrap();
        drop(file);

        journal.append(&put_field("c", "3")).unwrap();
        journal.close().unwrap();
        drop(journal);

        let journal = Journal::open(test_config(dir.path())).unwrap();
        let entries: Vec<_> = journal.read_all().unwrap().into_iter().map(|(_, e)| e).collect();
        assert_eq!(entries, vec![put_field("a", "1"), put_field("c", "3")]);
    }

    #[test]
    fn test_corrupt_record_cuts_tail() {
        let dir = TempDir::new().unwrap();
        let path = {
            let journal = Journal::open(test_config(dir.path())).unwrap();
            journal.append(&put_field("a", "1")).unwrap();
            journal.append(&put_field("b", "2")).unwrap();
            journal.path()
        };

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let journal = Journal::open(test_config(dir.path())).unwrap();
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, put_field("a", "1"));
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(test_config(dir.path())).unwrap();
        for i in 0..20 {
            journal.append(&put_field("a", &i.to_string())).unwrap();
        }
        assert_eq!(journal.record_count(), 20);

        journal.rewrite(&[put_field("a", "19")]).unwrap();
        assert_eq!(journal.record_count(), 1);

        journal.append(&put_field("b", "x")).unwrap();
        drop(journal);

        let journal = Journal::open(test_config(dir.path())).unwrap();
        let entries: Vec<JournalEntry> =
            journal.read_all().unwrap().into_iter().map(|(_, e)| e).collect();
        assert_eq!(entries, vec![put_field("a", "19"), put_field("b", "x")]);
        // Sequence keeps increasing across rewrites
        assert!(journal.next_sequence() > 21);
    }

    #[test]
    fn test_closed_journal_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(test_config(dir.path())).unwrap();
        journal.close().unwrap();
        assert!(matches!(
            journal.append(&put_field("a", "1")),
            Err(JournalError::Closed)
        ));
    }

    #[test]
    fn test_fsync_every_n() {
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new(dir.path()).with_fsync_policy(FsyncPolicy::EveryN(3));
        let journal = Journal::open(config).unwrap();
        for i in 0..6 {
            journal.append(&put_field("a", &i.to_string())).unwrap();
        }
        let stats = journal.stats();
        assert_eq!(stats.writes, 6);
        assert_eq!(stats.fsyncs, 2);
    }
}
