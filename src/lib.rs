//! # EmberKV
//!
//! An in-memory key-value store with point-in-time snapshots:
//! - Consistent saves of a live, mutating keyspace (copy-on-write tables)
//! - Single-file (`.rdb`) and sharded (`.dfs` + summary) snapshot formats
//! - Templated, path-safe snapshot names with `{timestamp}`
//! - Local directory or object storage backends
//! - Startup autoload and cron-scheduled saves
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Console / Clients                        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Command
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Engine                               │
//! └───────┬──────────────────┬──────────────────────┬───────────┘
//!         │                  │                      │
//!         ▼                  ▼                      ▼
//!  ┌─────────────┐   ┌───────────────┐      ┌──────────────┐
//!  │  Keyspace   │◀──│  Coordinator  │◀─────│CronScheduler │
//!  │ (shards +   │   │  / Loader     │      └──────────────┘
//!  │  memory)    │◀──│               │
//!  └─────────────┘   └───────┬───────┘
//!                            │ codecs
//!                            ▼
//!                    ┌───────────────┐
//!                    │StorageBackend │
//!                    │ (local / S3)  │
//!                    └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod pattern;
pub mod keyspace;
pub mod storage;
pub mod snapshot;
pub mod protocol;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{EmberError, Result};
pub use config::Config;
pub use engine::{Engine, Session};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
