//! Record stream format
//!
//! Shared by single-file snapshots and shard data files.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (16 bytes)                                           │
//! │   Magic: "EMBR" (4) | Version: u16 (2) | Kind: u8 (1)       │
//! │   Reserved: u8 (1)  | RecordCount: u64 (8)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Body (variable)                                             │
//! │   [Len: u32][bincode(db, key, value)]                       │
//! │   ... repeated for each key ...                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (4 bytes)                                            │
//! │   BodyCRC: u32                                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use serde::Serialize;

use crate::error::{EmberError, Result};
use crate::keyspace::Value;

use super::SnapshotRecord;

/// Magic bytes identifying an EmberKV record stream
pub(crate) const MAGIC: &[u8; 4] = b"EMBR";

/// Current record stream version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + Kind (1) + Reserved (1) + Count (8)
pub(crate) const HEADER_SIZE: usize = 16;

/// Footer size: BodyCRC (4)
pub(crate) const FOOTER_SIZE: usize = 4;

/// What a record stream file is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    /// A complete single-file snapshot (a main file)
    SingleFile = 1,

    /// One shard of a sharded snapshot (never a main file)
    Shard = 2,
}

impl FileKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(FileKind::SingleFile),
            2 => Ok(FileKind::Shard),
            other => Err(EmberError::Codec(format!("unknown file kind {}", other))),
        }
    }
}

/// Borrowed form of `SnapshotRecord`; serializes identically
#[derive(Serialize)]
struct RecordRef<'a> {
    db: u16,
    key: &'a [u8],
    value: &'a Value,
}

/// Builds a record stream in memory
pub struct RecordWriter {
    buf: Vec<u8>,
    hasher: crc32fast::Hasher,
    record_count: u64,
}

impl RecordWriter {
    /// Start a stream of the given kind
    ///
    /// Writes the header immediately; the record count is patched in `finish()`.
    pub fn new(kind: FileKind) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.push(kind as u8);
        buf.push(0); // Reserved
        buf.extend_from_slice(&0u64.to_le_bytes()); // Placeholder for record count

        Self {
            buf,
            hasher: crc32fast::Hasher::new(),
            record_count: 0,
        }
    }

    /// Append one key
    pub fn push(&mut self, db: usize, key: &[u8], value: &Value) -> Result<()> {
        let db = u16::try_from(db)
            .map_err(|_| EmberError::Codec(format!("database index {} does not fit u16", db)))?;
        let record = RecordRef { db, key, value };
        let encoded = bincode::serialize(&record).map_err(|e| EmberError::codec("encode record", e))?;
        let len = u32::try_from(encoded.len())
            .map_err(|_| EmberError::Codec(format!("record of {} bytes is too large", encoded.len())))?;

        let len_bytes = len.to_le_bytes();
        self.buf.extend_from_slice(&len_bytes);
        self.buf.extend_from_slice(&encoded);
        self.hasher.update(&len_bytes);
        self.hasher.update(&encoded);
        self.record_count += 1;
        Ok(())
    }

    /// Number of records written so far
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Patch the header and append the footer
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[8..16].copy_from_slice(&self.record_count.to_le_bytes());
        let crc = self.hasher.finalize();
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

/// Parse a complete record stream, checking it is of `expected` kind
pub fn read_records(data: &[u8], expected: FileKind) -> Result<Vec<SnapshotRecord>> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(EmberError::Codec(format!(
            "file too short: {} bytes",
            data.len()
        )));
    }

    // Validate header
    if &data[0..4] != MAGIC {
        return Err(EmberError::Codec(format!(
            "invalid magic: expected EMBR, got {:?}",
            &data[0..4]
        )));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(EmberError::Codec(format!("unsupported version: {}", version)));
    }
    let kind = FileKind::from_byte(data[6])?;
    if kind != expected {
        return Err(EmberError::Codec(format!(
            "expected a {:?} file, found a {:?} file",
            expected, kind
        )));
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&data[8..16]);
    let record_count = u64::from_le_bytes(count_bytes);

    // Validate checksum before parsing anything in the body
    let body_end = data.len() - FOOTER_SIZE;
    let body = &data[HEADER_SIZE..body_end];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[body_end..]);
    let expected_crc = u32::from_le_bytes(crc_bytes);
    let actual_crc = crc32fast::hash(body);
    if expected_crc != actual_crc {
        return Err(EmberError::Codec(format!(
            "checksum mismatch: expected {:08x}, computed {:08x}",
            expected_crc, actual_crc
        )));
    }

    // Parse records: [len(4)][bincode]
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        if pos + 4 > body.len() {
            return Err(EmberError::Codec("truncated record length".to_string()));
        }
        let len = u32::from_le_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;

        if pos + len > body.len() {
            return Err(EmberError::Codec(format!(
                "truncated record: expected {} bytes, {} left",
                len,
                body.len() - pos
            )));
        }
        let record: SnapshotRecord = bincode::deserialize(&body[pos..pos + len])
            .map_err(|e| EmberError::codec("decode record", e))?;
        pos += len;
        records.push(record);
    }

    if records.len() as u64 != record_count {
        return Err(EmberError::Codec(format!(
            "record count mismatch: header says {}, found {}",
            record_count,
            records.len()
        )));
    }

    Ok(records)
}
