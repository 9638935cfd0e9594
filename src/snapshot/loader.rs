//! Loader
//!
//! Finds a snapshot's main file, decodes it and applies it to the keyspace.
//!
//! ## Load Sequence
//! 1. Take the persistence gate for loading (released on every exit path)
//! 2. Confine the requested path to the backend location
//! 3. Resolve the main file (a `.dfs` pattern only matches `-summary.dfs`)
//! 4. Decode every file into a `SnapshotImage`
//! 5. Check the image fits the keyspace, then apply it record by record
//!
//! Nothing in the keyspace changes before step 5, so a missing shard or a
//! corrupt file leaves the dataset as it was.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{EmberError, Result};
use crate::keyspace::Keyspace;
use crate::pattern::has_wildcards;
use crate::storage::StorageBackend;

use super::codec::{codec_for, format_of, SnapshotImage};
use super::filename::{is_sharded_name, is_summary_file, timestamp_of, FilenameTemplate};
use super::gate::{PersistenceGate, Phase};
use super::SnapshotFormat;

/// What happens to keys already in the keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Keep existing keys; snapshot keys overwrite on collision
    Merge,

    /// Flush everything first
    Replace,
}

/// Outcome of a successful load
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub main_file: String,
    pub format: SnapshotFormat,

    /// Keys applied
    pub keys: usize,

    /// Every file read, main file last
    pub files: Vec<String>,
}

/// Reloads snapshots into a keyspace
pub struct Loader {
    backend: Arc<dyn StorageBackend>,
    keyspace: Arc<Keyspace>,
    gate: Arc<PersistenceGate>,
}

impl Loader {
    pub fn new(backend: Arc<dyn StorageBackend>, keyspace: Arc<Keyspace>) -> Self {
        Self::with_gate(backend, keyspace, Arc::new(PersistenceGate::new()))
    }

    /// Build a loader that excludes saves holding the same gate
    pub fn with_gate(
        backend: Arc<dyn StorageBackend>,
        keyspace: Arc<Keyspace>,
        gate: Arc<PersistenceGate>,
    ) -> Self {
        Self {
            backend,
            keyspace,
            gate,
        }
    }

    /// Load the snapshot named by `raw_path`
    ///
    /// `raw_path` may be the main file itself or a glob that resolves to
    /// exactly one main file. Fails with `Loading` if another load is
    /// running and `Busy` if a save holds the gate.
    pub fn load(&self, raw_path: &str, mode: LoadMode) -> Result<LoadReport> {
        let _guard = self.gate.enter(Phase::Loading)?;

        let pattern = self.backend.locate(raw_path)?;
        let main = self.find_main_file(&pattern)?;
        self.apply_main(&main, mode)
    }

    /// Load the newest snapshot saved under `template`, if any
    ///
    /// Both formats are searched. With `{timestamp}` in the template only
    /// names carrying a well-formed timestamp count, and the latest wins;
    /// without it, finding one snapshot per format is ambiguous. An empty
    /// template disables autoload.
    pub fn autoload(&self, template: &FilenameTemplate) -> Result<Option<LoadReport>> {
        if template.is_empty() {
            debug!("Autoload disabled: empty dbfilename");
            return Ok(None);
        }

        let _guard = self.gate.enter(Phase::Loading)?;

        let glob = template.glob(self.backend.location())?;
        let rdb_pattern = glob.rdb_file();
        let summary_pattern = glob.summary_file();
        let mut candidates = self.backend.list(&rdb_pattern)?;
        candidates.extend(
            self.backend
                .list(&summary_pattern)?
                .into_iter()
                .filter(|name| is_summary_file(name)),
        );

        if template.has_timestamp() {
            candidates.retain(|name| {
                let stamped = timestamp_of(&rdb_pattern, name)
                    .or_else(|| timestamp_of(&summary_pattern, name))
                    .is_some();
                if !stamped {
                    debug!(file = %name, "Ignoring autoload match without a timestamp");
                }
                stamped
            });
        }
        candidates.sort();
        candidates.dedup();

        let main = if template.has_timestamp() {
            candidates.pop()
        } else {
            match candidates.len() {
                0 => None,
                1 => candidates.pop(),
                _ => {
                    return Err(EmberError::MainFileAmbiguous {
                        pattern: template.as_str().to_string(),
                        candidates,
                    })
                }
            }
        };

        match main {
            Some(main) => {
                info!(main = %main, "Autoloading snapshot");
                self.apply_main(&main, LoadMode::Merge).map(Some)
            }
            None => {
                info!(template = template.as_str(), "No snapshot found, starting empty");
                Ok(None)
            }
        }
    }

    /// Resolve a contained name or glob to exactly one main file
    pub fn find_main_file(&self, pattern: &str) -> Result<String> {
        let matches = if has_wildcards(pattern) {
            self.backend.list(pattern)?
        } else if self.backend.exists(pattern)? {
            vec![pattern.to_string()]
        } else {
            Vec::new()
        };

        let sharded = is_sharded_name(pattern);
        let mut candidates: Vec<String> = matches
            .into_iter()
            .filter(|name| !sharded || is_summary_file(name))
            .collect();

        match candidates.len() {
            0 => Err(EmberError::MainFileMissing(pattern.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => Err(EmberError::MainFileAmbiguous {
                pattern: pattern.to_string(),
                candidates,
            }),
        }
    }

    /// True while a load is in progress
    pub fn is_loading(&self) -> bool {
        self.gate.is_loading()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn apply_main(&self, main: &str, mode: LoadMode) -> Result<LoadReport> {
        let format = format_of(main);
        let image = codec_for(format).decode(main, self.backend.as_ref())?;
        self.check_fits(&image)?;

        if mode == LoadMode::Replace {
            let flushed = self.keyspace.flush_all();
            debug!(keys = flushed, "Flushed keyspace before load");
        }

        let keys = image.len();
        for record in image.records {
            self.keyspace
                .insert(record.db as usize, record.key, record.value)?;
        }

        info!(main = %main, format = %format, keys, "Snapshot loaded");
        Ok(LoadReport {
            main_file: main.to_string(),
            format,
            keys,
            files: image.files,
        })
    }

    fn check_fits(&self, image: &SnapshotImage) -> Result<()> {
        let db_count = self.keyspace.db_count();
        match image.records.iter().find(|r| r.db as usize >= db_count) {
            Some(record) => Err(EmberError::Codec(format!(
                "snapshot uses database {} but only {} are configured",
                record.db, db_count
            ))),
            None => Ok(()),
        }
    }
}
