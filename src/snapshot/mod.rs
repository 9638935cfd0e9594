//! Snapshot Module
//!
//! Point-in-time dumps of the whole keyspace, and their reload.
//!
//! ## Responsibilities
//! - Resolve filename templates into contained names (`filename`)
//! - Encode/decode the single-file and sharded formats (`codec`)
//! - Keep saves and loads from overlapping (`gate`)
//! - Serialize saves and publish their files (`coordinator`)
//! - Locate main files and reload them, including startup autoload (`loader`)
//! - Fire saves from a cron schedule (`cron`, `scheduler`)
//!
//! ## Save Path
//! ```text
//!  SAVE / shutdown / cron fire
//!              │
//!              ▼
//!   ┌─────────────────────┐  Busy / Loading  ┌──────────────────┐
//!   │ SnapshotCoordinator │─────────────────▶│ caller retries   │
//!   └──────────┬──────────┘                  └──────────────────┘
//!              │ resolve → capture → encode → stage → publish
//!              ▼
//!   ┌─────────────────────┐
//!   │   StorageBackend    │
//!   └─────────────────────┘
//! ```

pub mod codec;
pub mod coordinator;
pub mod cron;
pub mod filename;
pub mod gate;
pub mod loader;
pub mod scheduler;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{EmberError, Result};

pub use coordinator::{LastSave, SnapshotCoordinator};
pub use cron::CronSchedule;
pub use filename::{FilenameTemplate, ResolvedName};
pub use gate::{PersistenceGate, Phase};
pub use loader::{LoadMode, LoadReport, Loader};
pub use scheduler::{CronScheduler, SaveTrigger, ScheduleState};

/// On-disk encoding of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// One consolidated `.rdb` file
    SingleFile,

    /// One `.dfs` data file per shard plus a `-summary.dfs` manifest
    Sharded,
}

impl SnapshotFormat {
    /// Name used by the `SAVE` command
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotFormat::SingleFile => "RDB",
            SnapshotFormat::Sharded => "DF",
        }
    }
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SnapshotFormat {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RDB" => Ok(SnapshotFormat::SingleFile),
            "DF" => Ok(SnapshotFormat::Sharded),
            other => Err(EmberError::Protocol(format!(
                "unknown snapshot format '{}', expected RDB or DF",
                other
            ))),
        }
    }
}

/// Lifecycle of a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One save attempt
#[derive(Debug, Clone)]
pub struct SnapshotJob {
    /// Process-unique, increasing id
    pub id: u64,

    /// Requested encoding
    pub format: SnapshotFormat,

    /// Backend-relative names written, main file last
    pub files: Vec<String>,

    pub state: JobState,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Number of keys captured
    pub keys: usize,

    /// Failure description when `state == Failed`
    pub error: Option<String>,
}

impl SnapshotJob {
    fn new(id: u64, format: SnapshotFormat) -> Self {
        Self {
            id,
            format,
            files: Vec::new(),
            state: JobState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            keys: 0,
            error: None,
        }
    }

    /// The file that identifies this snapshot
    pub fn main_file(&self) -> Option<&str> {
        self.files.last().map(String::as_str)
    }

    fn succeed(&mut self) {
        self.state = JobState::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    fn fail(&mut self, error: &EmberError) {
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.to_string());
    }
}
