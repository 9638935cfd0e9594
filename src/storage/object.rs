//! Object storage backend
//!
//! Maps snapshot names onto `<prefix>/<name>` keys in one bucket. The
//! transport is behind `ObjectClient`; an in-memory client is provided for
//! tests and embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{EmberError, Result};
use crate::pattern::glob_match;

use super::{split_pattern, StorageBackend, StorageLocation};

/// Minimal S3-style object API
pub trait ObjectClient: Send + Sync {
    /// Store an object, replacing any previous one atomically
    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Fetch an object; `EmberError::NotFound` if absent
    fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// All keys starting with `prefix`, sorted
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object; no-op if absent
    fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Object client keeping buckets in memory
#[derive(Default)]
pub struct InMemoryObjectClient {
    buckets: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects in a bucket
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map(|b| b.len()).unwrap_or(0)
    }
}

impl ObjectClient for InMemoryObjectClient {
    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| EmberError::NotFound(format!("{}/{}", bucket, key)))
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|b| {
                b.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }
}

/// Snapshot files stored as objects under a bucket prefix
///
/// Staged files are held in memory until `publish`, which issues a single
/// PUT; partially written objects are therefore never visible.
pub struct ObjectStorageBackend {
    location: StorageLocation,
    bucket: String,
    prefix: String,
    client: Arc<dyn ObjectClient>,
    staged: Mutex<HashMap<String, Bytes>>,
}

impl ObjectStorageBackend {
    /// Create a backend for an object storage location
    pub fn new(location: StorageLocation, client: Arc<dyn ObjectClient>) -> Result<Self> {
        let (bucket, prefix) = match &location {
            StorageLocation::Object { bucket, prefix } => (bucket.clone(), prefix.clone()),
            StorageLocation::Local { root, .. } => {
                return Err(EmberError::Config(format!(
                    "{} is not an object storage location",
                    root.display()
                )))
            }
        };
        Ok(Self {
            location,
            bucket,
            prefix,
            client,
            staged: Mutex::new(HashMap::new()),
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

impl StorageBackend for ObjectStorageBackend {
    fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        match self.client.get_object(&self.bucket, &self.key(name)) {
            Ok(body) => Ok(body.to_vec()),
            Err(EmberError::NotFound(_)) => Err(EmberError::NotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    fn stage(&self, name: &str, data: &[u8]) -> Result<()> {
        self.staged
            .lock()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn publish(&self, name: &str) -> Result<()> {
        let body = self.staged.lock().remove(name).ok_or_else(|| {
            EmberError::Storage(format!("nothing staged under {}", name))
        })?;
        let key = self.key(name);
        debug!(bucket = %self.bucket, key = %key, bytes = body.len(), "Uploading snapshot object");
        self.client.put_object(&self.bucket, &key, body)
    }

    fn discard(&self, name: &str) -> Result<()> {
        self.staged.lock().remove(name);
        Ok(())
    }

    fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let (dir, file_pattern) = split_pattern(pattern)?;
        let dir_key = if dir.is_empty() {
            self.key("")
        } else {
            format!("{}/", self.key(dir))
        };
        // `key("")` is either "" or "<prefix>/"
        let mut names: Vec<String> = self
            .client
            .list_objects(&self.bucket, &dir_key)?
            .into_iter()
            .filter_map(|key| {
                let file_name = key.strip_prefix(&dir_key)?;
                if file_name.contains('/') {
                    return None;
                }
                if !glob_match(file_pattern.as_bytes(), file_name.as_bytes()) {
                    return None;
                }
                Some(if dir.is_empty() {
                    file_name.to_string()
                } else {
                    format!("{}/{}", dir, file_name)
                })
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.client.delete_object(&self.bucket, &self.key(name))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match self.client.get_object(&self.bucket, &self.key(name)) {
            Ok(_) => Ok(true),
            Err(EmberError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
