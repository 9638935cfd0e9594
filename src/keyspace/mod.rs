//! Keyspace Module
//!
//! The authoritative in-memory dataset.
//!
//! ## Responsibilities
//! - Typed values (string, list, set, hash, sorted set) per logical database
//! - Partition keys across independently locked shards
//! - Drive memory accounting from every mutation path
//! - Hand out point-in-time views for snapshotting
//!
//! ## Layout
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Keyspace                          │
//! │  ┌────────────┐ ┌────────────┐        ┌────────────┐     │
//! │  │  Shard 0   │ │  Shard 1   │  ...   │  Shard N   │     │
//! │  │  RwLock    │ │  RwLock    │        │  RwLock    │     │
//! │  │ db0: Arc<> │ │ db0: Arc<> │        │ db0: Arc<> │     │
//! │  │ db1: Arc<> │ │ db1: Arc<> │        │ db1: Arc<> │     │
//! │  └────────────┘ └────────────┘        └────────────┘     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each per-database table sits behind an `Arc`. A snapshot clones the `Arc`s
//! of every shard while holding all shard read locks; writers go through
//! `Arc::make_mut`, so a table shared with a running save is copied once and
//! the save keeps seeing the state it captured.

mod memory;
mod table;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use memory::{MemoryAccounting, MemoryCounters};
pub use table::{DbTable, Keyspace, KeyspaceSnapshot, ShardSnapshot};

/// Fixed per-key bookkeeping charged on top of the key bytes
pub(crate) const KEY_OVERHEAD: u64 = 16;

/// Fixed per-element bookkeeping for compound values
const ELEMENT_OVERHEAD: u64 = 16;

/// Fixed bookkeeping for a hash/zset slot (bucket + pointers)
const SLOT_OVERHEAD: u64 = 32;

/// A stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    ZSet(HashMap<Vec<u8>, f64>),
}

impl Value {
    /// The type tag used for memory accounting and `TYPE`
    pub fn object_type(&self) -> ObjectType {
        match self {
            Value::String(_) => ObjectType::String,
            Value::List(_) => ObjectType::List,
            Value::Set(_) => ObjectType::Set,
            Value::Hash(_) => ObjectType::Hash,
            Value::ZSet(_) => ObjectType::ZSet,
        }
    }

    /// Approximate heap bytes held by this value.
    ///
    /// Depends only on the contents, so a value decoded from a snapshot is
    /// charged exactly what the original was.
    pub fn memory_usage(&self) -> u64 {
        match self {
            Value::String(bytes) => bytes.len() as u64,
            Value::List(items) => items
                .iter()
                .map(|item| item.len() as u64 + ELEMENT_OVERHEAD)
                .sum(),
            Value::Set(members) => members
                .iter()
                .map(|member| member.len() as u64 + ELEMENT_OVERHEAD)
                .sum(),
            Value::Hash(fields) => fields
                .iter()
                .map(|(field, value)| (field.len() + value.len()) as u64 + SLOT_OVERHEAD)
                .sum(),
            Value::ZSet(members) => members
                .keys()
                .map(|member| member.len() as u64 + 8 + SLOT_OVERHEAD)
                .sum(),
        }
    }
}

/// Object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    String = 0,
    List = 1,
    Set = 2,
    Hash = 3,
    ZSet = 4,
}

impl ObjectType {
    /// Number of distinct type tags
    pub const COUNT: usize = 5;

    /// All tags, in counter order
    pub const ALL: [ObjectType; ObjectType::COUNT] = [
        ObjectType::String,
        ObjectType::List,
        ObjectType::Set,
        ObjectType::Hash,
        ObjectType::ZSet,
    ];

    /// Lowercase name as reported by `TYPE` and `INFO MEMORY`
    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Set => "set",
            ObjectType::Hash => "hash",
            ObjectType::ZSet => "zset",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
