//! Engine Module
//!
//! Wires the keyspace to the snapshot machinery and executes commands.
//!
//! ## Responsibilities
//! - Validate configuration and refuse unsafe snapshot names at startup
//! - Autoload the newest snapshot before serving anything
//! - Route commands to the keyspace, coordinator, loader and scheduler
//! - Stop the scheduler and take a final save on shutdown
//!
//! ## Startup
//! ```text
//! Config ─▶ validate ─▶ resolve dbfilename ─▶ open backend ─▶ autoload ─▶ start cron
//!              │              │ PathEscape          │              │
//!              └──────────────┴─────────────────────┴──────────────┴──▶ Engine::open fails
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{EmberError, Result};
use crate::keyspace::{Keyspace, MemoryAccounting, MemoryCounters, ObjectType, Value};
use crate::protocol::{Command, ConfigParam, InfoSection, Reply};
use crate::snapshot::{
    CronScheduler, FilenameTemplate, JobState, LoadMode, Loader, PersistenceGate, SaveTrigger,
    SnapshotCoordinator, SnapshotFormat, SnapshotJob,
};
use crate::storage::{open_backend, ObjectClient, StorageBackend, StorageLocation};

/// Per-connection state
#[derive(Debug, Default, Clone)]
pub struct Session {
    db: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently selected database
    pub fn db(&self) -> usize {
        self.db
    }
}

/// The running store
///
/// ## Concurrency Model
/// - `execute` takes `&self`; share the engine behind an `Arc`
/// - Keyspace writes lock one shard; saves copy-on-write, never block writers
/// - At most one save runs at a time (`Busy` otherwise)
/// - Saves and loads share one gate and never overlap
/// - Data commands and saves are refused with `Loading` while a load runs
pub struct Engine {
    config: Config,
    template: FilenameTemplate,
    backend: Arc<dyn StorageBackend>,
    keyspace: Arc<Keyspace>,
    coordinator: Arc<SnapshotCoordinator>,
    loader: Arc<Loader>,
    scheduler: CronScheduler,
}

impl Engine {
    /// Open an engine
    ///
    /// On startup:
    /// 1. Validate the configuration
    /// 2. Reject a `dbfilename` that escapes `dir`
    /// 3. Open the storage backend
    /// 4. Autoload the newest matching snapshot (fatal on failure)
    /// 5. Start the cron scheduler
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_client(config, None)
    }

    /// Open an engine whose `dir` may be object storage reached via `client`
    pub fn open_with_client(config: Config, client: Option<Arc<dyn ObjectClient>>) -> Result<Self> {
        // Step 1: Configuration
        config.validate()?;
        let location = StorageLocation::parse(&config.dir)?;
        let template = FilenameTemplate::new(config.dbfilename.clone());

        // Step 2: Containment, before any I/O
        if !template.is_empty() {
            template.resolve(&location, Utc::now())?;
        }

        // Step 3: Backend and keyspace
        let backend = open_backend(&location, client)?;
        let memory = Arc::new(MemoryAccounting::new());
        let keyspace = Arc::new(Keyspace::new(config.shard_count, config.db_count, memory));
        let gate = Arc::new(PersistenceGate::new());
        let coordinator = Arc::new(SnapshotCoordinator::with_gate(
            Arc::clone(&backend),
            Arc::clone(&keyspace),
            Arc::clone(&gate),
        ));
        let loader = Arc::new(Loader::with_gate(
            Arc::clone(&backend),
            Arc::clone(&keyspace),
            gate,
        ));

        // Step 4: Autoload
        match loader.autoload(&template) {
            Ok(Some(report)) => {
                coordinator.reset_changes();
                info!(main = %report.main_file, keys = report.keys, "Dataset restored");
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Autoload failed");
                return Err(e);
            }
        }

        // Step 5: Scheduler
        let trigger: Arc<dyn SaveTrigger> = {
            let coordinator = Arc::clone(&coordinator);
            let template = template.clone();
            let format = config.snapshot_format;
            Arc::new(move || coordinator.save(format, &template).map(|_| ()))
        };
        let scheduler = CronScheduler::start(config.snapshot_cron.as_deref(), trigger)?;

        info!(
            dir = %backend.location().describe(),
            dbfilename = template.as_str(),
            format = %config.snapshot_format,
            shards = keyspace.shard_count(),
            databases = keyspace.db_count(),
            "Engine ready"
        );

        Ok(Self {
            config,
            template,
            backend,
            keyspace,
            coordinator,
            loader,
            scheduler,
        })
    }

    /// Execute a command
    ///
    /// Routes commands to appropriate handlers
    pub fn execute(&self, session: &mut Session, command: Command) -> Result<Reply> {
        if command.is_data_command() && self.loader.is_loading() {
            return Err(EmberError::Loading);
        }

        let db = session.db;
        match command {
            // -----------------------------------------------------------------
            // Connection
            // -----------------------------------------------------------------
            Command::Ping { message } => Ok(match message {
                Some(message) => Reply::Bulk(message),
                None => Reply::Status("PONG".to_string()),
            }),
            Command::Select { db } => {
                if db >= self.keyspace.db_count() {
                    return Err(EmberError::InvalidDb(db));
                }
                session.db = db;
                Ok(Reply::Ok)
            }

            // -----------------------------------------------------------------
            // Keyspace
            // -----------------------------------------------------------------
            Command::Set { key, value } => {
                self.keyspace.insert(db, key, Value::String(value))?;
                Ok(Reply::Ok)
            }
            Command::Get { key } => match self.keyspace.get(db, &key)? {
                None => Ok(Reply::Nil),
                Some(Value::String(value)) => Ok(Reply::Bulk(value)),
                Some(_) => Err(EmberError::WrongType),
            },
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if self.keyspace.remove(db, &key)?.is_some() {
                        removed += 1;
                    }
                }
                Ok(Reply::count(removed))
            }
            Command::Exists { keys } => {
                let mut found = 0;
                for key in keys {
                    if self.keyspace.contains(db, &key)? {
                        found += 1;
                    }
                }
                Ok(Reply::count(found))
            }
            Command::Type { key } => Ok(Reply::Status(
                self.keyspace
                    .object_type(db, &key)?
                    .map_or("none", |t| t.name())
                    .to_string(),
            )),
            Command::Keys { pattern } => Ok(Reply::Array(
                self.keyspace
                    .keys(db, &pattern)?
                    .into_iter()
                    .map(Reply::Bulk)
                    .collect(),
            )),
            Command::DbSize => Ok(Reply::count(self.keyspace.db_len(db)?)),
            Command::FlushAll => {
                let removed = self.keyspace.flush_all();
                info!(keys = removed, "Flushed all databases");
                Ok(Reply::Ok)
            }
            Command::RPush { key, values } => {
                let len = self.keyspace.update(
                    db,
                    &key,
                    || Value::List(VecDeque::new()),
                    |value| match value {
                        Value::List(items) => {
                            items.extend(values);
                            Ok(items.len())
                        }
                        _ => Err(EmberError::WrongType),
                    },
                )?;
                Ok(Reply::count(len))
            }
            Command::SAdd { key, members } => {
                let added = self.keyspace.update(
                    db,
                    &key,
                    || Value::Set(HashSet::new()),
                    |value| match value {
                        Value::Set(set) => Ok(members
                            .into_iter()
                            .map(|member| set.insert(member))
                            .filter(|&added| added)
                            .count()),
                        _ => Err(EmberError::WrongType),
                    },
                )?;
                Ok(Reply::count(added))
            }
            Command::HSet { key, pairs } => {
                let added = self.keyspace.update(
                    db,
                    &key,
                    || Value::Hash(HashMap::new()),
                    |value| match value {
                        Value::Hash(fields) => Ok(pairs
                            .into_iter()
                            .map(|(field, value)| fields.insert(field, value).is_none())
                            .filter(|&added| added)
                            .count()),
                        _ => Err(EmberError::WrongType),
                    },
                )?;
                Ok(Reply::count(added))
            }
            Command::ZAdd { key, entries } => {
                let added = self.keyspace.update(
                    db,
                    &key,
                    || Value::ZSet(HashMap::new()),
                    |value| match value {
                        Value::ZSet(members) => Ok(entries
                            .into_iter()
                            .map(|(score, member)| members.insert(member, score).is_none())
                            .filter(|&added| added)
                            .count()),
                        _ => Err(EmberError::WrongType),
                    },
                )?;
                Ok(Reply::count(added))
            }

            // -----------------------------------------------------------------
            // Persistence
            // -----------------------------------------------------------------
            Command::Save { format, filename } => {
                let format = format.unwrap_or(self.config.snapshot_format);
                let template = match filename {
                    Some(filename) => FilenameTemplate::new(filename),
                    None => self.template.clone(),
                };
                self.coordinator.save(format, &template)?;
                Ok(Reply::Ok)
            }
            Command::LastSave => Ok(Reply::Integer(
                self.coordinator
                    .last_save()
                    .map_or(0, |save| save.finished_at.timestamp()),
            )),
            Command::DebugLoad { path } => {
                if let Err(e) = self.loader.load(&path, LoadMode::Replace) {
                    error!(path = %path, error = %e, "Load failed");
                    return Err(e);
                }
                self.coordinator.reset_changes();
                Ok(Reply::Ok)
            }
            Command::DebugPopulate {
                count,
                prefix,
                size,
            } => {
                let mut created = 0;
                for i in 0..count {
                    let key = format!("{}:{}", prefix, i).into_bytes();
                    if self.keyspace.contains(db, &key)? {
                        continue;
                    }
                    self.keyspace.insert(db, key, Value::String(populate_value(i, size)))?;
                    created += 1;
                }
                info!(requested = count, created, db, "Populated keyspace");
                Ok(Reply::Ok)
            }

            // -----------------------------------------------------------------
            // Server
            // -----------------------------------------------------------------
            Command::ConfigGet { param } => {
                let value = match param {
                    ConfigParam::SnapshotCron => self
                        .scheduler
                        .schedule()
                        .expr()
                        .unwrap_or_default()
                        .to_string(),
                    ConfigParam::Dir => self.backend.location().describe(),
                    ConfigParam::DbFilename => self.template.as_str().to_string(),
                };
                Ok(Reply::Array(vec![
                    Reply::text(param.name()),
                    Reply::text(value),
                ]))
            }
            Command::ConfigSet { param, value } => match param {
                ConfigParam::SnapshotCron => {
                    self.scheduler.set_schedule(Some(&value))?;
                    Ok(Reply::Ok)
                }
                ConfigParam::Dir | ConfigParam::DbFilename => Err(EmberError::Config(format!(
                    "{} cannot be changed at runtime",
                    param.name()
                ))),
            },
            Command::Info { section } => Ok(Reply::text(self.info(section))),
        }
    }

    /// Stop the scheduler and save one last time
    ///
    /// The final save uses the configured format and `dbfilename`; an empty
    /// `dbfilename` skips it. A failed save is logged, not returned.
    pub fn shutdown(&self) {
        self.scheduler.stop();

        if self.template.is_empty() {
            info!("Shutdown save skipped: empty dbfilename");
            return;
        }
        match self.coordinator.save(self.config.snapshot_format, &self.template) {
            Ok(job) => info!(main = job.main_file().unwrap_or_default(), "Shutdown save complete"),
            Err(e) => warn!(error = %e, "Shutdown save failed"),
        }
    }

    // =========================================================================
    // INFO
    // =========================================================================

    /// Render `INFO` output for one section or all of them
    pub fn info(&self, section: Option<InfoSection>) -> String {
        let sections: Vec<InfoSection> = match section {
            Some(section) => vec![section],
            None => InfoSection::ALL.to_vec(),
        };

        let mut out = String::new();
        for (i, section) in sections.into_iter().enumerate() {
            if i > 0 {
                out.push_str("\r\n");
            }
            out.push_str(&format!("# {}\r\n", section.title()));
            let lines = match section {
                InfoSection::Persistence => self.persistence_info(),
                InfoSection::Memory => memory_info(&self.memory_counters()),
                InfoSection::Keyspace => self.keyspace_info(),
            };
            for (field, value) in lines {
                out.push_str(&format!("{}:{}\r\n", field, value));
            }
        }
        out
    }

    fn persistence_info(&self) -> Vec<(String, String)> {
        let schedule = self.scheduler.schedule();
        let last_save = self.coordinator.last_save();
        let last_job = self.coordinator.last_job();

        let mut lines = vec![
            field("loading", u8::from(self.loader.is_loading())),
            field("saving", u8::from(self.coordinator.is_saving())),
            field(
                "changes_since_last_save",
                self.coordinator.changes_since_last_save(),
            ),
            field(
                "last_save_time",
                last_save.as_ref().map_or(0, |s| s.finished_at.timestamp()),
            ),
            field(
                "last_save_format",
                last_save.as_ref().map_or("none", |s| s.format.name()),
            ),
            field(
                "last_save_file",
                last_save
                    .as_ref()
                    .and_then(|s| s.main_file())
                    .unwrap_or_default(),
            ),
            field("last_save_status", job_status(last_job.as_ref())),
        ];
        if let Some(error) = last_job.as_ref().and_then(|job| job.error.as_deref()) {
            lines.push(field("last_save_error", error));
        }
        lines.push(field("snapshot_cron", schedule.expr().unwrap_or_default()));
        lines.push(field(
            "next_save_time",
            schedule.next_fire.map_or(0, |t| t.timestamp()),
        ));
        lines
    }

    fn keyspace_info(&self) -> Vec<(String, String)> {
        (0..self.keyspace.db_count())
            .filter_map(|db| {
                let keys = self.keyspace.db_len(db).ok()?;
                (keys > 0).then(|| field(&format!("db{}", db), format!("keys={}", keys)))
            })
            .collect()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the snapshot backend
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Get the keyspace
    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    /// Get the save coordinator
    pub fn coordinator(&self) -> &Arc<SnapshotCoordinator> {
        &self.coordinator
    }

    /// Get the loader
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// Get the cron scheduler
    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    /// Current memory counters
    pub fn memory_counters(&self) -> MemoryCounters {
        self.keyspace.memory().snapshot_counters()
    }

    /// Save with the configured format and `dbfilename`
    pub fn save(&self) -> Result<SnapshotJob> {
        self.coordinator
            .save(self.config.snapshot_format, &self.template)
    }

    /// Save in a specific format under the configured `dbfilename`
    pub fn save_as(&self, format: SnapshotFormat) -> Result<SnapshotJob> {
        self.coordinator.save(format, &self.template)
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// `object_used_memory` plus one line per non-zero type
fn memory_info(counters: &MemoryCounters) -> Vec<(String, String)> {
    let mut lines = vec![field("object_used_memory", counters.total)];
    lines.extend(
        counters
            .non_zero()
            .map(|(object_type, bytes)| field(&type_memory_field(object_type), bytes)),
    );
    lines
}

fn type_memory_field(object_type: ObjectType) -> String {
    format!("type_used_memory_{}", object_type.name())
}

fn job_status(job: Option<&SnapshotJob>) -> &'static str {
    match job.map(|job| job.state) {
        None => "none",
        Some(JobState::Succeeded) => "ok",
        Some(JobState::Failed) => "err",
        Some(JobState::Pending) | Some(JobState::Running) => "in_progress",
    }
}

/// Deterministic `DEBUG POPULATE` payload of exactly `size` bytes
fn populate_value(i: usize, size: usize) -> Vec<u8> {
    let mut value = format!("value:{}", i).into_bytes();
    value.resize(size, b'x');
    value
}
