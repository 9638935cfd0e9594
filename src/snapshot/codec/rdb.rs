//! Single-file codec
//!
//! Every shard and every database in one record stream.

use tracing::debug;

use crate::error::Result;
use crate::keyspace::KeyspaceSnapshot;
use crate::snapshot::filename::ResolvedName;
use crate::snapshot::SnapshotFormat;
use crate::storage::StorageBackend;

use super::{read_records, EncodedFile, FileKind, RecordWriter, SnapshotCodec, SnapshotImage};

/// Consolidated `.rdb` snapshots
pub struct SingleFileCodec;

impl SnapshotCodec for SingleFileCodec {
    fn format(&self) -> SnapshotFormat {
        SnapshotFormat::SingleFile
    }

    fn encode(&self, snapshot: &KeyspaceSnapshot, name: &ResolvedName) -> Result<Vec<EncodedFile>> {
        let mut writer = RecordWriter::new(FileKind::SingleFile);
        for shard in snapshot.shards() {
            for (db, key, value) in shard.entries() {
                writer.push(db, key, value)?;
            }
        }

        let file = EncodedFile {
            name: name.rdb_file(),
            data: writer.finish(),
        };
        debug!(file = %file.name, bytes = file.data.len(), "Encoded single-file snapshot");
        Ok(vec![file])
    }

    fn decode(&self, main: &str, backend: &dyn StorageBackend) -> Result<SnapshotImage> {
        let data = backend.read(main)?;
        let records = read_records(&data, FileKind::SingleFile)?;
        Ok(SnapshotImage {
            format: SnapshotFormat::SingleFile,
            records,
            files: vec![main.to_string()],
        })
    }
}
