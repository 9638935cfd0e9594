//! Format Codecs
//!
//! Turn a frozen keyspace into snapshot files and back.
//!
//! Encoding is pure: it produces named byte buffers and never touches a
//! backend, so the coordinator decides when anything becomes visible.
//! Decoding reads through the backend and returns a fully validated
//! `SnapshotImage` before the keyspace is modified.

mod format;
mod rdb;
mod sharded;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keyspace::{KeyspaceSnapshot, Value};
use crate::storage::StorageBackend;

use super::filename::{is_sharded_name, ResolvedName};
use super::SnapshotFormat;

pub use format::{read_records, FileKind, RecordWriter};
pub use rdb::SingleFileCodec;
pub use sharded::{ShardedCodec, SnapshotManifest};

/// One key as stored in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub db: u16,
    pub key: Vec<u8>,
    pub value: Value,
}

/// A file produced by an encoder
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// Backend-relative name
    pub name: String,
    pub data: Vec<u8>,
}

/// A decoded, validated snapshot ready to be applied
#[derive(Debug, Clone)]
pub struct SnapshotImage {
    pub format: SnapshotFormat,

    /// Every record, in file order
    pub records: Vec<SnapshotRecord>,

    /// Files read, main file last
    pub files: Vec<String>,
}

impl SnapshotImage {
    /// Number of keys in the image
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Encoder/decoder for one snapshot format
pub trait SnapshotCodec: Send + Sync {
    /// The format this codec implements
    fn format(&self) -> SnapshotFormat;

    /// Encode a frozen keyspace under `name`; the main file comes last
    fn encode(&self, snapshot: &KeyspaceSnapshot, name: &ResolvedName) -> Result<Vec<EncodedFile>>;

    /// Read and validate the snapshot whose main file is `main`
    fn decode(&self, main: &str, backend: &dyn StorageBackend) -> Result<SnapshotImage>;
}

/// Codec for a format
pub fn codec_for(format: SnapshotFormat) -> &'static dyn SnapshotCodec {
    match format {
        SnapshotFormat::SingleFile => &SingleFileCodec,
        SnapshotFormat::Sharded => &ShardedCodec,
    }
}

/// Format implied by a main file's name
pub fn format_of(main: &str) -> SnapshotFormat {
    if is_sharded_name(main) {
        SnapshotFormat::Sharded
    } else {
        SnapshotFormat::SingleFile
    }
}
