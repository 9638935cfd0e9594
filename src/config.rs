//! Configuration for EmberKV
//!
//! Centralized configuration with sensible defaults. Read once at startup;
//! only the snapshot schedule can change afterwards (see `CONFIG SET`).

use crate::error::{EmberError, Result};
use crate::snapshot::SnapshotFormat;

/// Main configuration for an EmberKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Snapshot Location
    // -------------------------------------------------------------------------
    /// Base location for snapshot files.
    /// Either a local directory (`./data`) or an object storage prefix
    /// (`s3://bucket/prefix`). Every resolved snapshot name must stay inside it.
    pub dir: String,

    /// Snapshot filename template, relative to `dir`.
    /// May contain `{timestamp}`. Empty disables autoload and shutdown saves.
    pub dbfilename: String,

    // -------------------------------------------------------------------------
    // Snapshot Behaviour
    // -------------------------------------------------------------------------
    /// Default format used by `SAVE` without an explicit format,
    /// by scheduled saves and by the shutdown save
    pub snapshot_format: SnapshotFormat,

    /// Optional 5-field cron expression for periodic saves
    pub snapshot_cron: Option<String>,

    // -------------------------------------------------------------------------
    // Keyspace Layout
    // -------------------------------------------------------------------------
    /// Number of independently locked keyspace shards
    /// (also the number of data files in a sharded snapshot)
    pub shard_count: usize,

    /// Number of logical databases (`SELECT 0..db_count`)
    pub db_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: "./emberkv_data".to_string(),
            dbfilename: "dump-{timestamp}".to_string(),
            snapshot_format: SnapshotFormat::Sharded,
            snapshot_cron: None,
            shard_count: 4,
            db_count: 16,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check values that cannot be expressed in the type system
    pub fn validate(&self) -> Result<()> {
        if self.dir.trim().is_empty() {
            return Err(EmberError::Config("dir must not be empty".to_string()));
        }
        if self.shard_count == 0 || self.shard_count > 9999 {
            return Err(EmberError::Config(format!(
                "shard_count must be within 1..=9999, got {}",
                self.shard_count
            )));
        }
        if self.db_count == 0 || self.db_count > u16::MAX as usize {
            return Err(EmberError::Config(format!(
                "db_count must be within 1..={}, got {}",
                u16::MAX,
                self.db_count
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the base snapshot location (local directory or `s3://bucket/prefix`)
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.config.dir = dir.into();
        self
    }

    /// Set the snapshot filename template
    pub fn dbfilename(mut self, template: impl Into<String>) -> Self {
        self.config.dbfilename = template.into();
        self
    }

    /// Set the default snapshot format
    pub fn snapshot_format(mut self, format: SnapshotFormat) -> Self {
        self.config.snapshot_format = format;
        self
    }

    /// Set the snapshot schedule (5-field cron expression)
    pub fn snapshot_cron(mut self, expr: impl Into<String>) -> Self {
        self.config.snapshot_cron = Some(expr.into());
        self
    }

    /// Set the number of keyspace shards
    pub fn shard_count(mut self, count: usize) -> Self {
        self.config.shard_count = count;
        self
    }

    /// Set the number of logical databases
    pub fn db_count(mut self, count: usize) -> Self {
        self.config.db_count = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
