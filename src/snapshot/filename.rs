//! Filename Resolver
//!
//! Expands a `dbfilename` template into concrete, contained names and
//! derives the per-format file names from it.
//!
//! ## Naming Convention
//! ```text
//! template              single-file                 sharded
//! ───────────────────   ─────────────────────────   ───────────────────────────────
//! dump                  dump.rdb                    dump-0000.dfs … dump-summary.dfs
//! dump.rdb              dump.rdb                    dump-0000.dfs … dump-summary.dfs
//! backup.bin            backup.bin                  backup.bin-0000.dfs …
//! dump-{timestamp}      dump-2024-05-01T10:00:00.rdb
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{EmberError, Result};
use crate::storage::{StorageLocation, STAGING_SUFFIX};

use super::SnapshotFormat;

/// Placeholder replaced by the save time
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// Sortable rendering of the save time (UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Extension of single-file snapshots
pub const RDB_EXTENSION: &str = "rdb";

/// Extension of sharded snapshot files
pub const DFS_EXTENSION: &str = "dfs";

/// Marker distinguishing the manifest from shard data files
pub const SUMMARY_MARKER: &str = "summary";

/// Name used by `SAVE` when no template is configured
pub const DEFAULT_NAME: &str = "dump";

/// An unexpanded filename template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    raw: String,
}

impl FilenameTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The template as configured
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// True if the template contains `{timestamp}`
    pub fn has_timestamp(&self) -> bool {
        self.raw.contains(TIMESTAMP_PLACEHOLDER)
    }

    /// Substitute the placeholder, leaving everything else literal
    pub fn render(&self, timestamp: &str) -> String {
        self.raw.replace(TIMESTAMP_PLACEHOLDER, timestamp)
    }

    /// Expand for a save at `now` and confine the result to `base`
    pub fn resolve(&self, base: &StorageLocation, now: DateTime<Utc>) -> Result<ResolvedName> {
        resolve(self, base, now)
    }

    /// Expand with `*` in place of the timestamp, for discovery
    pub fn glob(&self, base: &StorageLocation) -> Result<ResolvedName> {
        let stem = base.contain(&self.render("*"))?;
        Ok(ResolvedName { stem })
    }
}

/// Expand `template` for a save at `now`, rejecting names outside `base`
///
/// Runs before any I/O; a `PathEscape` here means nothing was touched.
/// Names ending in the staging suffix are refused: backends treat such
/// files as leftovers of interrupted saves.
pub fn resolve(
    template: &FilenameTemplate,
    base: &StorageLocation,
    now: DateTime<Utc>,
) -> Result<ResolvedName> {
    let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
    let stem = base.contain(&template.render(&timestamp))?;
    let file_name = stem.rsplit('/').next().unwrap_or(&stem);
    if file_name.ends_with(STAGING_SUFFIX) {
        return Err(EmberError::Config(format!(
            "snapshot name '{}' uses the reserved suffix '{}'",
            stem, STAGING_SUFFIX
        )));
    }
    Ok(ResolvedName { stem })
}

/// A contained, normalized name before format decoration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    stem: String,
}

impl ResolvedName {
    /// The bare name
    pub fn as_str(&self) -> &str {
        &self.stem
    }

    /// Name of the file that identifies a snapshot in `format`
    pub fn main_file(&self, format: SnapshotFormat) -> String {
        match format {
            SnapshotFormat::SingleFile => self.rdb_file(),
            SnapshotFormat::Sharded => self.summary_file(),
        }
    }

    /// Single-file name: literal if it already has an extension
    pub fn rdb_file(&self) -> String {
        if file_extension(&self.stem).is_some() {
            self.stem.clone()
        } else {
            format!("{}.{}", self.stem, RDB_EXTENSION)
        }
    }

    /// Data file of one shard in the sharded format
    pub fn shard_file(&self, shard: usize) -> String {
        format!("{}-{:04}.{}", self.sharded_stem(), shard, DFS_EXTENSION)
    }

    /// Manifest file of the sharded format
    pub fn summary_file(&self) -> String {
        format!("{}-{}.{}", self.sharded_stem(), SUMMARY_MARKER, DFS_EXTENSION)
    }

    fn sharded_stem(&self) -> &str {
        match file_extension(&self.stem) {
            Some(ext) if ext == RDB_EXTENSION || ext == DFS_EXTENSION => {
                &self.stem[..self.stem.len() - ext.len() - 1]
            }
            _ => &self.stem,
        }
    }
}

/// Save time encoded in `name`, where `pattern` is a template glob
///
/// Every `*` in the pattern stands for the same rendered timestamp, so a
/// manual save that happens to match the glob (`dump-backup.rdb` against
/// `dump-*.rdb`) yields `None`.
pub fn timestamp_of(pattern: &str, name: &str) -> Option<NaiveDateTime> {
    let wildcards = pattern.matches('*').count();
    if wildcards == 0 {
        return None;
    }
    let literal = pattern.len() - wildcards;
    let width = name.len().checked_sub(literal)?;
    if width % wildcards != 0 {
        return None;
    }

    let start = pattern.find('*')?;
    let timestamp = name.get(start..start + width / wildcards)?;
    if pattern.replace('*', timestamp) != name {
        return None;
    }
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()
}

/// True if `name` is the main file of a sharded snapshot
pub fn is_summary_file(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name.ends_with(&format!("-{}.{}", SUMMARY_MARKER, DFS_EXTENSION))
}

/// True if a name (or pattern) refers to the sharded format
pub fn is_sharded_name(name: &str) -> bool {
    file_extension(name) == Some(DFS_EXTENSION)
}

/// Extension of the final path segment, if any
fn file_extension(name: &str) -> Option<&str> {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}
