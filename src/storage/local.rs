//! Local filesystem backend
//!
//! Stages to `<name>.tmp`, fsyncs, then renames into place.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{EmberError, Result};
use crate::pattern::glob_match;

use super::{split_pattern, StorageBackend, StorageLocation, STAGING_SUFFIX};

/// Snapshot files in a local directory
pub struct LocalFsBackend {
    location: StorageLocation,
    root: PathBuf,
}

impl LocalFsBackend {
    /// Open or create the directory
    ///
    /// On startup:
    /// 1. Create the directory if it doesn't exist
    /// 2. Remove orphaned staging files left by an interrupted save, at any depth
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        let location = StorageLocation::parse(&root.to_string_lossy())?;
        let location = match fs::canonicalize(root) {
            Ok(canonical) => location.with_alias(canonical),
            Err(_) => location,
        };
        let root = match &location {
            StorageLocation::Local { root, .. } => root.clone(),
            StorageLocation::Object { .. } => root.to_path_buf(),
        };

        Self::cleanup_staged_files(&root)?;

        Ok(Self { location, root })
    }

    /// Absolute root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn full_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, STAGING_SUFFIX))
    }

    /// Remove `*.tmp` files from a previous interrupted save, in `dir` and
    /// every subdirectory (templates may resolve below the root)
    ///
    /// Symlinks are not followed.
    fn cleanup_staged_files(dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if let Err(e) = Self::cleanup_staged_files(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to scan for staging files");
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                debug!(path = %path.display(), "Removing orphaned staging file");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove staging file");
                }
            }
        }
        Ok(())
    }

    fn sync_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            // Directory fsync is not supported everywhere (e.g. Windows)
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalFsBackend {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        match fs::read(self.full_path(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EmberError::NotFound(name.to_string())),
            Err(e) => Err(EmberError::Io(e)),
        }
    }

    fn stage(&self, name: &str, data: &[u8]) -> Result<()> {
        let temp_path = self.staging_path(name);
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        debug!(path = %temp_path.display(), bytes = data.len(), "Staged snapshot file");
        Ok(())
    }

    fn publish(&self, name: &str) -> Result<()> {
        let temp_path = self.staging_path(name);
        let final_path = self.full_path(name);
        fs::rename(&temp_path, &final_path).map_err(|e| {
            EmberError::Storage(format!(
                "failed to publish {}: {}",
                final_path.display(),
                e
            ))
        })?;
        Self::sync_parent(&final_path)
    }

    fn discard(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.staging_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EmberError::Io(e)),
        }
    }

    fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let (dir, file_pattern) = split_pattern(pattern)?;
        let dir_path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.full_path(dir)
        };

        let entries = match fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EmberError::Io(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(STAGING_SUFFIX) {
                continue;
            }
            if glob_match(file_pattern.as_bytes(), file_name.as_bytes()) {
                names.push(if dir.is_empty() {
                    file_name
                } else {
                    format!("{}/{}", dir, file_name)
                });
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.full_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EmberError::Io(e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.full_path(name).is_file())
    }
}
