//! Sharded keyspace implementation
//!
//! HashMap-per-database tables, sharded by key hash, shared copy-on-write
//! with in-flight snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EmberError, Result};
use crate::pattern::glob_match;

use super::{MemoryAccounting, ObjectType, Value, KEY_OVERHEAD};

/// One logical database within one shard
pub type DbTable = HashMap<Vec<u8>, Value>;

/// A single shard: one table per logical database
struct Shard {
    dbs: Vec<Arc<DbTable>>,
}

impl Shard {
    fn new(db_count: usize) -> Self {
        Self {
            dbs: (0..db_count).map(|_| Arc::new(DbTable::new())).collect(),
        }
    }
}

/// The in-memory dataset
///
/// ## Concurrency:
/// - Each shard is protected by its own RwLock; a key only ever touches one
/// - `snapshot()` holds every shard read lock at once, for as long as it takes
///   to clone one `Arc` per table
/// - Every mutation path charges `MemoryAccounting`, including bulk loads
pub struct Keyspace {
    shards: Vec<RwLock<Shard>>,
    db_count: usize,
    memory: Arc<MemoryAccounting>,
    /// Monotonic count of successful mutations
    mutations: AtomicU64,
}

impl Keyspace {
    /// Create an empty keyspace
    pub fn new(shard_count: usize, db_count: usize, memory: Arc<MemoryAccounting>) -> Self {
        let shard_count = shard_count.max(1);
        let db_count = db_count.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| RwLock::new(Shard::new(db_count)))
                .collect(),
            db_count,
            memory,
            mutations: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a copy of a value
    pub fn get(&self, db: usize, key: &[u8]) -> Result<Option<Value>> {
        self.check_db(db)?;
        let shard = self.shards[self.shard_index(key)].read();
        Ok(shard.dbs[db].get(key).cloned())
    }

    /// Check whether a key exists
    pub fn contains(&self, db: usize, key: &[u8]) -> Result<bool> {
        self.check_db(db)?;
        let shard = self.shards[self.shard_index(key)].read();
        Ok(shard.dbs[db].contains_key(key))
    }

    /// Type of the value stored at a key
    pub fn object_type(&self, db: usize, key: &[u8]) -> Result<Option<ObjectType>> {
        self.check_db(db)?;
        let shard = self.shards[self.shard_index(key)].read();
        Ok(shard.dbs[db].get(key).map(Value::object_type))
    }

    /// All keys in a database matching a glob pattern
    pub fn keys(&self, db: usize, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.check_db(db)?;
        let mut keys = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            keys.extend(
                shard.dbs[db]
                    .keys()
                    .filter(|key| glob_match(pattern, key))
                    .cloned(),
            );
        }
        keys.sort();
        Ok(keys)
    }

    /// Number of keys in one database
    pub fn db_len(&self, db: usize) -> Result<usize> {
        self.check_db(db)?;
        Ok(self.shards.iter().map(|s| s.read().dbs[db].len()).sum())
    }

    /// Number of keys across all databases
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().dbs.iter().map(|t| t.len()).sum::<usize>())
            .sum()
    }

    /// True if no database holds any key
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or replace a value, returning the previous one
    ///
    /// This is the single entry point for whole-value writes: client `SET`s
    /// and snapshot loads both come through here.
    pub fn insert(&self, db: usize, key: Vec<u8>, value: Value) -> Result<Option<Value>> {
        self.check_db(db)?;
        let mut shard = self.shards[self.shard_index(&key)].write();
        let table = Arc::make_mut(&mut shard.dbs[db]);

        let new_type = value.object_type();
        let new_size = value.memory_usage();
        let key_size = key.len() as u64 + KEY_OVERHEAD;

        let previous = table.insert(key, value);
        match &previous {
            Some(old) => self.memory.on_remove(old.object_type(), old.memory_usage()),
            None => self.memory.on_insert(ObjectType::String, key_size),
        }
        self.memory.on_insert(new_type, new_size);
        self.mutations.fetch_add(1, Ordering::Relaxed);

        Ok(previous)
    }

    /// Mutate a value in place, creating it with `default` if absent
    ///
    /// `apply` must leave the value untouched when it returns an error.
    /// The size difference is charged to the value's type.
    pub fn update<R>(
        &self,
        db: usize,
        key: &[u8],
        default: impl FnOnce() -> Value,
        apply: impl FnOnce(&mut Value) -> Result<R>,
    ) -> Result<R> {
        self.check_db(db)?;
        let mut shard = self.shards[self.shard_index(key)].write();
        let table = Arc::make_mut(&mut shard.dbs[db]);

        let outcome = match table.get_mut(key) {
            Some(value) => {
                let before_type = value.object_type();
                let before = value.memory_usage();
                let outcome = apply(value)?;
                let after_type = value.object_type();
                let after = value.memory_usage();
                if before_type == after_type {
                    self.memory.on_resize(after_type, before, after);
                } else {
                    self.memory.on_remove(before_type, before);
                    self.memory.on_insert(after_type, after);
                }
                outcome
            }
            None => {
                let mut value = default();
                let outcome = apply(&mut value)?;
                self.memory
                    .on_insert(ObjectType::String, key.len() as u64 + KEY_OVERHEAD);
                self.memory.on_insert(value.object_type(), value.memory_usage());
                table.insert(key.to_vec(), value);
                outcome
            }
        };

        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Remove a key, returning its value
    pub fn remove(&self, db: usize, key: &[u8]) -> Result<Option<Value>> {
        self.check_db(db)?;
        let mut shard = self.shards[self.shard_index(key)].write();
        if !shard.dbs[db].contains_key(key) {
            return Ok(None);
        }

        let table = Arc::make_mut(&mut shard.dbs[db]);
        let removed = table.remove(key);
        if let Some(value) = &removed {
            self.release(key, value);
            self.mutations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Remove every key from every database
    ///
    /// Tables shared with a running snapshot are detached, not cleared,
    /// so the snapshot is unaffected.
    pub fn flush_all(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            for table in shard.dbs.iter_mut() {
                let old = std::mem::replace(table, Arc::new(DbTable::new()));
                for (key, value) in old.iter() {
                    self.release(key, value);
                }
                removed += old.len();
            }
        }
        if removed > 0 {
            self.mutations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    // =========================================================================
    // Snapshotting
    // =========================================================================

    /// Capture a point-in-time view of every shard
    ///
    /// All shard read locks are held together, so no write lands between the
    /// capture of two shards.
    pub fn snapshot(&self) -> KeyspaceSnapshot {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        let shards = guards
            .iter()
            .enumerate()
            .map(|(id, shard)| ShardSnapshot {
                id,
                dbs: shard.dbs.iter().map(Arc::clone).collect(),
            })
            .collect();
        drop(guards);

        KeyspaceSnapshot {
            shards,
            db_count: self.db_count,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of logical databases
    pub fn db_count(&self) -> usize {
        self.db_count
    }

    /// Memory counters fed by this keyspace
    pub fn memory(&self) -> &Arc<MemoryAccounting> {
        &self.memory
    }

    /// Total number of mutations applied so far
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Shard that owns a key
    pub fn shard_index(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.shards.len()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_db(&self, db: usize) -> Result<()> {
        if db >= self.db_count {
            return Err(EmberError::InvalidDb(db));
        }
        Ok(())
    }

    fn release(&self, key: &[u8], value: &Value) {
        self.memory
            .on_remove(ObjectType::String, key.len() as u64 + KEY_OVERHEAD);
        self.memory.on_remove(value.object_type(), value.memory_usage());
    }
}

/// Frozen view of the whole keyspace
pub struct KeyspaceSnapshot {
    shards: Vec<ShardSnapshot>,
    db_count: usize,
}

impl KeyspaceSnapshot {
    /// Per-shard views, ordered by shard id
    pub fn shards(&self) -> &[ShardSnapshot] {
        &self.shards
    }

    /// Number of logical databases in the captured keyspace
    pub fn db_count(&self) -> usize {
        self.db_count
    }

    /// Total number of keys captured
    pub fn len(&self) -> usize {
        self.shards.iter().map(ShardSnapshot::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frozen view of one shard
pub struct ShardSnapshot {
    id: usize,
    dbs: Vec<Arc<DbTable>>,
}

impl ShardSnapshot {
    /// Shard id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of keys in this shard, across databases
    pub fn len(&self) -> usize {
        self.dbs.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate `(db, key, value)` over every database of the shard
    pub fn entries(&self) -> impl Iterator<Item = (usize, &[u8], &Value)> + '_ {
        self.dbs.iter().enumerate().flat_map(|(db, table)| {
            table
                .iter()
                .map(move |(key, value)| (db, key.as_slice(), value))
        })
    }
}
