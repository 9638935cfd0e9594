//! Snapshot Coordinator
//!
//! Serializes saves and publishes their files.
//!
//! ## Save Sequence
//! 1. Take the persistence gate (`Busy` during a save, `Loading` during a load)
//! 2. Resolve the filename template against the backend location
//! 3. Capture a point-in-time view of the keyspace
//! 4. Encode every file in memory
//! 5. Stage every file, then publish them with the main file last
//!
//! A failure at any step discards whatever was staged; files published by
//! earlier saves stay untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::keyspace::Keyspace;
use crate::storage::StorageBackend;

use super::codec::{codec_for, EncodedFile};
use super::filename::{FilenameTemplate, DEFAULT_NAME};
use super::gate::{PersistenceGate, Phase};
use super::{JobState, SnapshotFormat, SnapshotJob};

/// Marker left by the last successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSave {
    pub format: SnapshotFormat,

    /// Files written, main file last
    pub files: Vec<String>,

    pub finished_at: DateTime<Utc>,

    /// Keys captured
    pub keys: usize,
}

impl LastSave {
    /// The file that identifies the saved snapshot
    pub fn main_file(&self) -> Option<&str> {
        self.files.last().map(String::as_str)
    }
}

/// Owner of the process-wide save lock
pub struct SnapshotCoordinator {
    backend: Arc<dyn StorageBackend>,
    keyspace: Arc<Keyspace>,

    /// Shared with the loader; held for the whole save
    gate: Arc<PersistenceGate>,

    next_id: AtomicU64,

    /// Most recent terminal job, successful or not
    last_job: RwLock<Option<SnapshotJob>>,

    last_save: RwLock<Option<LastSave>>,

    /// Keyspace mutation counter as of the last successful capture
    mutations_at_save: AtomicU64,
}

impl SnapshotCoordinator {
    pub fn new(backend: Arc<dyn StorageBackend>, keyspace: Arc<Keyspace>) -> Self {
        Self::with_gate(backend, keyspace, Arc::new(PersistenceGate::new()))
    }

    /// Build a coordinator that excludes loads holding the same gate
    pub fn with_gate(
        backend: Arc<dyn StorageBackend>,
        keyspace: Arc<Keyspace>,
        gate: Arc<PersistenceGate>,
    ) -> Self {
        let mutations = keyspace.mutations();
        Self {
            backend,
            keyspace,
            gate,
            next_id: AtomicU64::new(1),
            last_job: RwLock::new(None),
            last_save: RwLock::new(None),
            mutations_at_save: AtomicU64::new(mutations),
        }
    }

    /// Save the whole keyspace
    ///
    /// Fails without waiting: `Busy` if another save is running, `Loading`
    /// if a load holds the gate. An empty template saves under `dump`.
    pub fn save(&self, format: SnapshotFormat, template: &FilenameTemplate) -> Result<SnapshotJob> {
        let _guard = self.gate.enter(Phase::Saving)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut job = SnapshotJob::new(id, format);
        job.state = JobState::Running;
        info!(job = id, format = %format, template = template.as_str(), "Save started");

        let result = self.run(&mut job, template);
        match &result {
            Ok(()) => {
                job.succeed();
                let finished_at = job.finished_at.unwrap_or_else(Utc::now);
                *self.last_save.write() = Some(LastSave {
                    format,
                    files: job.files.clone(),
                    finished_at,
                    keys: job.keys,
                });
                info!(
                    job = id,
                    main = job.main_file().unwrap_or_default(),
                    keys = job.keys,
                    "Save finished"
                );
            }
            Err(e) => {
                job.fail(e);
                error!(job = id, error = %e, "Save failed");
            }
        }

        *self.last_job.write() = Some(job.clone());
        result.map(|()| job)
    }

    /// True while a save holds the gate
    pub fn is_saving(&self) -> bool {
        self.gate.is_saving()
    }

    /// Marker of the last successful save
    pub fn last_save(&self) -> Option<LastSave> {
        self.last_save.read().clone()
    }

    /// Last job to reach a terminal state
    pub fn last_job(&self) -> Option<SnapshotJob> {
        self.last_job.read().clone()
    }

    /// Keyspace mutations not covered by the last successful save
    pub fn changes_since_last_save(&self) -> u64 {
        self.keyspace
            .mutations()
            .saturating_sub(self.mutations_at_save.load(Ordering::Acquire))
    }

    /// Treat the current keyspace as saved, e.g. right after a load
    pub fn reset_changes(&self) {
        self.mutations_at_save
            .store(self.keyspace.mutations(), Ordering::Release);
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn run(&self, job: &mut SnapshotJob, template: &FilenameTemplate) -> Result<()> {
        let fallback;
        let template = if template.is_empty() {
            fallback = FilenameTemplate::new(DEFAULT_NAME);
            &fallback
        } else {
            template
        };

        let name = template.resolve(self.backend.location(), job.started_at)?;

        // Mutations counted before the capture may still land in it; the
        // counter can only over-report pending changes, never under-report.
        let mutations = self.keyspace.mutations();
        let snapshot = self.keyspace.snapshot();
        job.keys = snapshot.len();
        debug!(job = job.id, name = name.as_str(), keys = job.keys, "Captured keyspace");

        let files = codec_for(job.format).encode(&snapshot, &name)?;
        drop(snapshot);

        self.stage_all(&files)?;
        self.publish_all(&files)?;

        job.files = files.into_iter().map(|f| f.name).collect();
        self.mutations_at_save.store(mutations, Ordering::Release);
        Ok(())
    }

    fn stage_all(&self, files: &[EncodedFile]) -> Result<()> {
        for (i, file) in files.iter().enumerate() {
            if let Err(e) = self.backend.stage(&file.name, &file.data) {
                self.discard(&files[..=i]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Publish in order; the main file is last so it only appears once
    /// every file it depends on is in place
    fn publish_all(&self, files: &[EncodedFile]) -> Result<()> {
        for (i, file) in files.iter().enumerate() {
            if let Err(e) = self.backend.publish(&file.name) {
                self.discard(&files[i..]);
                return Err(e);
            }
        }
        Ok(())
    }

    fn discard(&self, files: &[EncodedFile]) {
        for file in files {
            if let Err(e) = self.backend.discard(&file.name) {
                warn!(file = %file.name, error = %e, "Failed to discard staged file");
            }
        }
    }
}
