//! Storage Module
//!
//! Uniform byte-level access to the place snapshot files live.
//!
//! ## Responsibilities
//! - Read, list and delete named files under one base location
//! - Two-phase writes: `stage` every file of a snapshot, then `publish`
//!   them, so a failed save never replaces a durable copy
//! - Confine names to the base location (`StorageLocation::contain`)
//!
//! ## Backends
//! ```text
//! ┌──────────────────────┐      ┌───────────────────────────────┐
//! │   LocalFsBackend     │      │     ObjectStorageBackend      │
//! │  stage: <name>.tmp   │      │  stage: held in memory        │
//! │  publish: rename     │      │  publish: single PUT          │
//! └──────────────────────┘      └───────────────┬───────────────┘
//!                                               │ ObjectClient
//!                                               ▼
//!                                 InMemoryObjectClient / S3 client
//! ```
//!
//! Names passed to a backend are relative, `/`-separated and already
//! normalized by `StorageLocation::contain`.

mod local;
mod location;
mod object;

use std::sync::Arc;

use crate::error::{EmberError, Result};

pub use local::LocalFsBackend;
pub use location::{lexical_normalize, normalize_within, StorageLocation, OBJECT_SCHEME};
pub use object::{InMemoryObjectClient, ObjectClient, ObjectStorageBackend};

/// Suffix of files staged by `LocalFsBackend` before publication
pub const STAGING_SUFFIX: &str = ".tmp";

/// Read/write/list/delete contract shared by all snapshot destinations
pub trait StorageBackend: Send + Sync {
    /// The base location this backend is confined to
    fn location(&self) -> &StorageLocation;

    /// Read a whole file
    ///
    /// Returns `EmberError::NotFound` if the file does not exist.
    fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Write a file so that it is not yet visible under `name`
    fn stage(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Make a staged file visible under `name`, replacing any previous file
    fn publish(&self, name: &str) -> Result<()>;

    /// Drop a staged file; no-op if nothing is staged under `name`
    fn discard(&self, name: &str) -> Result<()>;

    /// List published files whose name matches a glob pattern
    ///
    /// Wildcards are only honoured in the final path segment. Results are
    /// sorted.
    fn list(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete a published file; no-op if absent
    fn delete(&self, name: &str) -> Result<()>;

    /// Check whether a published file exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Stage and publish in one step
    fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        self.stage(name, data)?;
        self.publish(name)
    }

    /// Map a user-supplied path onto a name relative to this backend
    fn locate(&self, raw: &str) -> Result<String> {
        self.location().contain(raw)
    }
}

/// Open the backend for a configured location
///
/// Object storage needs a client; local directories are created on demand.
pub fn open_backend(
    location: &StorageLocation,
    client: Option<Arc<dyn ObjectClient>>,
) -> Result<Arc<dyn StorageBackend>> {
    match location {
        StorageLocation::Local { root, .. } => Ok(Arc::new(LocalFsBackend::open(root)?)),
        StorageLocation::Object { .. } => {
            let client = client.ok_or_else(|| {
                EmberError::Config(format!(
                    "no object storage client configured for {}",
                    location.describe()
                ))
            })?;
            Ok(Arc::new(ObjectStorageBackend::new(location.clone(), client)?))
        }
    }
}

/// Split a pattern into its directory part and final segment
pub(crate) fn split_pattern(pattern: &str) -> Result<(&str, &str)> {
    let (dir, file) = match pattern.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", pattern),
    };
    if crate::pattern::has_wildcards(dir) {
        return Err(EmberError::Storage(format!(
            "wildcards are only supported in the file name: {}",
            pattern
        )));
    }
    Ok((dir, file))
}
