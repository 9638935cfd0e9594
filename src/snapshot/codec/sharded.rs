//! Sharded codec
//!
//! One record stream per keyspace shard plus a summary manifest.
//!
//! ## Manifest Format
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Magic: "EMBS" (4) | Version: u16 (2) | PayloadLen: u32 (4) │
//! ├────────────────────────────────────────────────────────────┤
//! │ Payload: bincode(SnapshotManifest)                         │
//! ├────────────────────────────────────────────────────────────┤
//! │ PayloadCRC: u32 (4)                                        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manifest lists shard files by bare file name, relative to the
//! manifest's own directory. Shard files carry no reference back.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EmberError, Result};
use crate::keyspace::KeyspaceSnapshot;
use crate::snapshot::filename::ResolvedName;
use crate::snapshot::SnapshotFormat;
use crate::storage::StorageBackend;

use super::{read_records, EncodedFile, FileKind, RecordWriter, SnapshotCodec, SnapshotImage};

/// Magic bytes identifying a manifest
const MANIFEST_MAGIC: &[u8; 4] = b"EMBS";

/// Current manifest version
const MANIFEST_VERSION: u16 = 1;

/// Magic (4) + Version (2) + PayloadLen (4)
const MANIFEST_HEADER_SIZE: usize = 10;

/// Index of one sharded snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Unix seconds at capture time
    pub created_at: i64,

    /// Number of logical databases in the captured keyspace
    pub db_count: u32,

    /// Total keys across all shard files
    pub key_count: u64,

    /// Shard data file names, indexed by shard id
    pub shard_files: Vec<String>,
}

impl SnapshotManifest {
    /// Serialize with header and checksum
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self).map_err(|e| EmberError::codec("encode manifest", e))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| EmberError::Codec("manifest too large".to_string()))?;

        let mut buf = Vec::with_capacity(MANIFEST_HEADER_SIZE + payload.len() + 4);
        buf.extend_from_slice(MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(buf)
    }

    /// Parse and validate a manifest
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MANIFEST_HEADER_SIZE + 4 {
            return Err(EmberError::Codec(format!(
                "manifest too short: {} bytes",
                data.len()
            )));
        }
        if &data[0..4] != MANIFEST_MAGIC {
            return Err(EmberError::Codec(format!(
                "invalid manifest magic: expected EMBS, got {:?}",
                &data[0..4]
            )));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != MANIFEST_VERSION {
            return Err(EmberError::Codec(format!(
                "unsupported manifest version: {}",
                version
            )));
        }
        let payload_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if data.len() != MANIFEST_HEADER_SIZE + payload_len + 4 {
            return Err(EmberError::Codec(format!(
                "manifest length mismatch: payload {} bytes, file {} bytes",
                payload_len,
                data.len()
            )));
        }

        let payload = &data[MANIFEST_HEADER_SIZE..MANIFEST_HEADER_SIZE + payload_len];
        let crc_start = MANIFEST_HEADER_SIZE + payload_len;
        let expected_crc = u32::from_le_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);
        if crc32fast::hash(payload) != expected_crc {
            return Err(EmberError::Codec("manifest checksum mismatch".to_string()));
        }

        let manifest: SnapshotManifest =
            bincode::deserialize(payload).map_err(|e| EmberError::codec("decode manifest", e))?;

        // Shard references are bare names; anything else could point elsewhere
        for file in &manifest.shard_files {
            if file.is_empty() || file.contains('/') || file.contains('\\') || file == ".." {
                return Err(EmberError::Codec(format!(
                    "invalid shard file reference '{}'",
                    file
                )));
            }
        }
        Ok(manifest)
    }
}

/// Multi-file `.dfs` snapshots
pub struct ShardedCodec;

impl SnapshotCodec for ShardedCodec {
    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::Sharded
    }

    fn encode(&self, snapshot: &KeyspaceSnapshot, name: &ResolvedName) -> Result<Vec<EncodedFile>> {
        let mut files = Vec::with_capacity(snapshot.shards().len() + 1);
        let mut shard_files = Vec::with_capacity(snapshot.shards().len());
        let mut key_count = 0;

        for shard in snapshot.shards() {
            let mut writer = RecordWriter::new(FileKind::Shard);
            for (db, key, value) in shard.entries() {
                writer.push(db, key, value)?;
            }
            key_count += writer.record_count();

            let file_name = name.shard_file(shard.id());
            shard_files.push(bare_name(&file_name).to_string());
            files.push(EncodedFile {
                name: file_name,
                data: writer.finish(),
            });
        }

        let manifest = SnapshotManifest {
            created_at: chrono::Utc::now().timestamp(),
            db_count: snapshot.db_count() as u32,
            key_count,
            shard_files,
        };
        files.push(EncodedFile {
            name: name.summary_file(),
            data: manifest.to_bytes()?,
        });

        debug!(
            summary = %name.summary_file(),
            shards = snapshot.shards().len(),
            keys = key_count,
            "Encoded sharded snapshot"
        );
        Ok(files)
    }

    fn decode(&self, main: &str, backend: &dyn StorageBackend) -> Result<SnapshotImage> {
        let manifest = SnapshotManifest::from_bytes(&backend.read(main)?)?;
        let dir = match main.rsplit_once('/') {
            Some((dir, _)) => format!("{}/", dir),
            None => String::new(),
        };

        // Load every shard by index before producing anything
        let mut shards = Vec::with_capacity(manifest.shard_files.len());
        let mut files = Vec::with_capacity(manifest.shard_files.len() + 1);
        for shard_file in &manifest.shard_files {
            let name = format!("{}{}", dir, shard_file);
            let data = backend.read(&name).map_err(|e| match e {
                EmberError::NotFound(_) => EmberError::Storage(format!(
                    "shard file {} referenced by {} is missing",
                    name, main
                )),
                other => other,
            })?;
            shards.push(read_records(&data, FileKind::Shard)?);
            files.push(name);
        }

        let records: Vec<_> = shards.into_iter().flatten().collect();
        if records.len() as u64 != manifest.key_count {
            return Err(EmberError::Codec(format!(
                "manifest lists {} keys, shard files hold {}",
                manifest.key_count,
                records.len()
            )));
        }

        files.push(main.to_string());
        Ok(SnapshotImage {
            format: SnapshotFormat::Sharded,
            records,
            files,
        })
    }
}

fn bare_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
