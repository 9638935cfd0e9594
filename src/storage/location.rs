//! Storage locations
//!
//! Parses the configured base location and confines every name to it.
//! All checks here are lexical; nothing touches the filesystem or network.

use std::path::{Component, Path, PathBuf};

use crate::error::{EmberError, Result};

/// URI scheme marking an object storage location
pub const OBJECT_SCHEME: &str = "s3://";

/// Where snapshot files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// A local directory
    Local {
        /// Absolute, lexically normalized root
        root: PathBuf,
        /// The same directory with symlinks resolved, when known
        alias: Option<PathBuf>,
    },

    /// A bucket plus key prefix (no leading or trailing slash)
    Object { bucket: String, prefix: String },
}

impl StorageLocation {
    /// Parse a configured `dir` value
    ///
    /// `s3://bucket/some/prefix` selects object storage; anything else is a
    /// local directory, made absolute against the current directory.
    pub fn parse(dir: &str) -> Result<Self> {
        if let Some(rest) = dir.strip_prefix(OBJECT_SCHEME) {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(EmberError::Config(format!("missing bucket in '{}'", dir)));
            }
            let prefix = if prefix.trim_matches('/').is_empty() {
                String::new()
            } else {
                normalize_within(prefix)?
            };
            return Ok(StorageLocation::Object {
                bucket: bucket.to_string(),
                prefix,
            });
        }

        let path = Path::new(dir);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(StorageLocation::Local {
            root: lexical_normalize(&absolute),
            alias: None,
        })
    }

    /// Record the symlink-resolved form of a local root
    pub fn with_alias(self, alias: PathBuf) -> Self {
        match self {
            StorageLocation::Local { root, .. } => StorageLocation::Local {
                root,
                alias: Some(alias),
            },
            other => other,
        }
    }

    /// Turn a user-supplied name into a normalized name relative to this
    /// location, or fail with `PathEscape`
    ///
    /// Accepts relative names, absolute local paths under the root, and
    /// bucket-qualified keys (`s3://bucket/prefix/name` or `bucket/prefix/name`)
    /// under the prefix.
    pub fn contain(&self, raw: &str) -> Result<String> {
        match self {
            StorageLocation::Local { root, alias } => {
                let path = Path::new(raw);
                if !path.is_absolute() {
                    return normalize_within(raw);
                }
                let normalized = lexical_normalize(path);
                let relative = std::iter::once(root)
                    .chain(alias.iter())
                    .find_map(|base| normalized.strip_prefix(base).ok())
                    .ok_or_else(|| EmberError::PathEscape(raw.to_string()))?;
                normalize_within(&relative.to_string_lossy().replace('\\', "/"))
            }
            StorageLocation::Object { bucket, prefix } => {
                let (qualified, rest) = match raw.strip_prefix(OBJECT_SCHEME) {
                    Some(rest) => (true, rest),
                    None => (false, raw),
                };

                let bucket_key = rest
                    .strip_prefix(bucket.as_str())
                    .and_then(|r| r.strip_prefix('/'));

                match bucket_key {
                    Some(key) if qualified || key_has_prefix(key, prefix) => {
                        let key = normalize_within(key)?;
                        strip_key_prefix(&key, prefix)
                            .ok_or_else(|| EmberError::PathEscape(raw.to_string()))
                    }
                    _ if qualified => Err(EmberError::PathEscape(raw.to_string())),
                    _ => normalize_within(raw),
                }
            }
        }
    }

    /// Human-readable form for logs and `CONFIG GET dir`
    pub fn describe(&self) -> String {
        match self {
            StorageLocation::Local { root, .. } => root.display().to_string(),
            StorageLocation::Object { bucket, prefix } if prefix.is_empty() => {
                format!("{}{}", OBJECT_SCHEME, bucket)
            }
            StorageLocation::Object { bucket, prefix } => {
                format!("{}{}/{}", OBJECT_SCHEME, bucket, prefix)
            }
        }
    }

    /// True for object storage locations
    pub fn is_object_storage(&self) -> bool {
        matches!(self, StorageLocation::Object { .. })
    }
}

/// Normalize a relative `/`-separated name, refusing to leave its root
///
/// `.` segments and empty segments are dropped, `..` pops one segment.
/// Absolute names and names that climb above the root are `PathEscape`.
pub fn normalize_within(candidate: &str) -> Result<String> {
    if candidate.starts_with('/') || candidate.starts_with('\\') || has_drive_prefix(candidate) {
        return Err(EmberError::PathEscape(candidate.to_string()));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in candidate.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(EmberError::PathEscape(candidate.to_string()));
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(EmberError::PathEscape(format!(
            "'{}' resolves to the base directory itself",
            candidate
        )));
    }
    Ok(segments.join("/"))
}

/// Collapse `.` and `..` in an absolute path without touching the filesystem
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

// =============================================================================
// Private Helpers
// =============================================================================

fn has_drive_prefix(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn key_has_prefix(key: &str, prefix: &str) -> bool {
    prefix.is_empty() || key == prefix || key.starts_with(&format!("{}/", prefix))
}

fn strip_key_prefix(key: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return Some(key.to_string());
    }
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}
