//! Journal records.
//!
//! On disk a record is a fixed header followed by its payload:
//!
//! ```text
//! magic "WKST" (4) | type (1) | sequence (8) | length (4) | crc32c (4) | payload
//! ```
//!
//! All integers are big-endian. The checksum covers the type, sequence and
//! length fields as well as the payload, so a damaged header is caught the
//! same way as a damaged payload. The payload is the JSON encoding of a
//! [`JournalEntry`]; every entry is a single row operation against the
//! logical context tables.

use crate::error::JournalError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic bytes for journal records: "WKST"
pub const JOURNAL_MAGIC: [u8; 4] = *b"WKST";

/// Maximum record payload size (4 MiB).
pub const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;

/// Row operation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JournalEntryType {
    /// Context row written (state id + reserved timestamp).
    PutContext = 1,
    PutTimer = 2,
    DeleteTimer = 3,
    PutField = 4,
    DeleteField = 5,
    /// Every row of a machine type removed.
    WipeMachine = 6,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => JournalEntryType::PutContext,
            2 => JournalEntryType::PutTimer,
            3 => JournalEntryType::DeleteTimer,
            4 => JournalEntryType::PutField,
            5 => JournalEntryType::DeleteField,
            6 => JournalEntryType::WipeMachine,
            other => return Err(other),
        })
    }
}

fn checksum(entry_type: JournalEntryType, sequence: u64, payload: &[u8]) -> u32 {
    let mut covered = [0u8; 13];
    covered[0] = entry_type as u8;
    covered[1..9].copy_from_slice(&sequence.to_be_bytes());
    covered[9..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    crc32c::crc32c_append(crc32c::crc32c(&covered), payload)
}

/// Header fields of a record.
#[derive(Debug, Clone)]
pub struct JournalRecordHeader {
    pub entry_type: JournalEntryType,
    pub sequence: u64,
    pub crc32c: u32,
}

/// A complete journal record (header + payload).
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub header: JournalRecordHeader,
    pub payload: Bytes,
}

impl JournalRecord {
    pub fn new(entry_type: JournalEntryType, sequence: u64, payload: Bytes) -> Self {
        Self {
            header: JournalRecordHeader {
                entry_type,
                sequence,
                crc32c: checksum(entry_type, sequence, &payload),
            },
            payload,
        }
    }

    /// Builds a record for a typed entry.
    pub fn from_entry(entry: &JournalEntry, sequence: u64) -> Result<Self, JournalError> {
        let payload = serde_json::to_vec(entry)?;
        Ok(Self::new(entry.entry_type(), sequence, Bytes::from(payload)))
    }

    /// Decodes the payload into a typed entry. The payload must describe the
    /// same operation as the header's type byte.
    pub fn entry(&self) -> Result<JournalEntry, JournalError> {
        let entry: JournalEntry = serde_json::from_slice(&self.payload)?;
        if entry.entry_type() != self.header.entry_type {
            return Err(JournalError::InvalidHeader {
                offset: 0,
                reason: format!(
                    "record {} is typed {:?} but holds {:?}",
                    self.header.sequence,
                    self.header.entry_type,
                    entry.entry_type()
                ),
            });
        }
        Ok(entry)
    }

    pub fn encode(&self) -> Result<BytesMut, JournalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&JOURNAL_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u64(self.header.sequence);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.header.crc32c);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a record from the front of `buf`, consuming it.
    ///
    /// Returns `Ok(None)`, leaving `buf` untouched, when the buffer holds
    /// less than one full record or starts with zero padding. Callers treat
    /// that as the end of valid data.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, JournalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..RECORD_HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic == [0; 4] {
            return Ok(None);
        }
        if magic != JOURNAL_MAGIC {
            return Err(JournalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let entry_type = JournalEntryType::try_from(header.get_u8()).map_err(|byte| {
            JournalError::InvalidHeader {
                offset,
                reason: format!("unknown entry type: {}", byte),
            }
        })?;
        let sequence = header.get_u64();
        let payload_len = header.get_u32() as usize;
        let crc_expected = header.get_u32();

        if payload_len > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();
        let crc_actual = checksum(entry_type, sequence, &payload);
        if crc_actual != crc_expected {
            return Err(JournalError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            header: JournalRecordHeader {
                entry_type,
                sequence,
                crc32c: crc_expected,
            },
            payload,
        }))
    }

    /// Total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// Typed journal entry: one row operation for one machine type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    PutContext {
        machine: String,
        state: i32,
        /// Reserved; written as 0 by the engine.
        #[serde(default)]
        timestamp: i64,
    },
    PutTimer {
        machine: String,
        timer: String,
        deadline: i64,
    },
    DeleteTimer {
        machine: String,
        timer: String,
    },
    PutField {
        machine: String,
        field: String,
        value: String,
    },
    DeleteField {
        machine: String,
        field: String,
    },
    WipeMachine {
        machine: String,
    },
}

impl JournalEntry {
    /// Returns the entry type for this entry.
    pub fn entry_type(&self) -> JournalEntryType {
        match self {
            JournalEntry::PutContext { .. } => JournalEntryType::PutContext,
            JournalEntry::PutTimer { .. } => JournalEntryType::PutTimer,
            JournalEntry::DeleteTimer { .. } => JournalEntryType::DeleteTimer,
            JournalEntry::PutField { .. } => JournalEntryType::PutField,
            JournalEntry::DeleteField { .. } => JournalEntryType::DeleteField,
            JournalEntry::WipeMachine { .. } => JournalEntryType::WipeMachine,
        }
    }

    /// Returns the machine type this entry belongs to.
    pub fn machine(&self) -> &str {
        match self {
            JournalEntry::PutContext { machine, .. }
            | JournalEntry::PutTimer { machine, .. }
            | JournalEntry::DeleteTimer { machine, .. }
            | JournalEntry::PutField { machine, .. }
            | JournalEntry::DeleteField { machine, .. }
            | JournalEntry::WipeMachine { machine } => machine,
        }
    }
}
