//! Integration tests for the Engine
//!
//! These tests verify:
//! - The command surface end to end
//! - Memory accounting reported by INFO MEMORY
//! - Autoload on startup for every naming scheme
//! - Path containment for configured and requested names
//! - Cron, shutdown and object storage saves

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use bytes::Bytes;
use chrono::{Duration, Utc};
use emberkv::error::Result;
use emberkv::keyspace::ObjectType;
use emberkv::protocol::{split_args, Command, Reply};
use emberkv::snapshot::SnapshotFormat;
use emberkv::storage::{InMemoryObjectClient, ObjectClient};
use emberkv::{Config, EmberError, Engine, Session};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config_in(dir: &Path, dbfilename: &str, format: SnapshotFormat) -> Config {
    Config::builder()
        .dir(dir.to_str().unwrap())
        .dbfilename(dbfilename)
        .snapshot_format(format)
        .shard_count(4)
        .build()
}

fn open_in(dir: &Path, dbfilename: &str, format: SnapshotFormat) -> Engine {
    Engine::open(config_in(dir, dbfilename, format)).unwrap()
}

fn run(engine: &Engine, session: &mut Session, line: &str) -> Result<Reply> {
    let args = split_args(line)?;
    engine.execute(session, Command::parse(&args)?)
}

/// Run a command that must succeed
fn ok(engine: &Engine, session: &mut Session, line: &str) -> Reply {
    run(engine, session, line).unwrap_or_else(|e| panic!("{} failed: {}", line, e))
}

fn bulk(text: &str) -> Reply {
    Reply::Bulk(text.as_bytes().to_vec())
}

fn info_text(engine: &Engine, session: &mut Session, section: &str) -> String {
    match ok(engine, session, &format!("INFO {}", section)) {
        Reply::Bulk(bytes) => String::from_utf8(bytes).unwrap(),
        other => panic!("unexpected INFO reply {:?}", other),
    }
}

/// `field:value` lines of an INFO reply
fn info_fields(text: &str) -> Vec<(String, String)> {
    text.split("\r\n")
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn info_field(text: &str, name: &str) -> Option<String> {
    info_fields(text)
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + StdDuration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(StdDuration::from_millis(10));
    }
    condition()
}

fn populate_all_types(engine: &Engine, session: &mut Session) {
    ok(engine, session, "DEBUG POPULATE 200 key 32");
    ok(engine, session, "RPUSH list a b c");
    ok(engine, session, "SADD set x y z");
    ok(engine, session, "HSET hash f1 v1 f2 v2");
    ok(engine, session, "ZADD zset 1 one 2.5 two");
    ok(engine, session, "SELECT 3");
    ok(engine, session, "SET other-db value");
    ok(engine, session, "SELECT 0");
}

// =============================================================================
// Command Tests
// =============================================================================

#[test]
fn test_string_commands() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    assert_eq!(ok(&engine, &mut session, "PING"), Reply::Status("PONG".to_string()));
    assert_eq!(ok(&engine, &mut session, "SET name \"hello world\""), Reply::Ok);
    assert_eq!(ok(&engine, &mut session, "GET name"), bulk("hello world"));
    assert_eq!(ok(&engine, &mut session, "GET missing"), Reply::Nil);
    assert_eq!(ok(&engine, &mut session, "EXISTS name missing"), Reply::Integer(1));
    assert_eq!(ok(&engine, &mut session, "TYPE name"), Reply::Status("string".to_string()));
    assert_eq!(ok(&engine, &mut session, "TYPE missing"), Reply::Status("none".to_string()));
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(1));
    assert_eq!(ok(&engine, &mut session, "DEL name missing"), Reply::Integer(1));
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(0));
}

#[test]
fn test_binary_values_survive_save_and_reload() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::Sharded);
        let mut session = Session::new();
        ok(&engine, &mut session, r#"SET "k\xfe" "\x00\x80\xff""#);
        assert_eq!(
            ok(&engine, &mut session, r#"GET "k\xfe""#),
            Reply::Bulk(vec![0x00, 0x80, 0xff])
        );
        ok(&engine, &mut session, "SAVE");
    }

    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::Sharded);
    assert_eq!(
        ok(&engine, &mut Session::new(), r#"GET "k\xfe""#),
        Reply::Bulk(vec![0x00, 0x80, 0xff])
    );
}

#[test]
fn test_compound_commands() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    assert_eq!(ok(&engine, &mut session, "RPUSH list a b"), Reply::Integer(2));
    assert_eq!(ok(&engine, &mut session, "RPUSH list c"), Reply::Integer(3));
    assert_eq!(ok(&engine, &mut session, "SADD set a b a"), Reply::Integer(2));
    assert_eq!(ok(&engine, &mut session, "SADD set b c"), Reply::Integer(1));
    assert_eq!(ok(&engine, &mut session, "HSET hash f v g w"), Reply::Integer(2));
    assert_eq!(ok(&engine, &mut session, "HSET hash f changed"), Reply::Integer(0));
    assert_eq!(ok(&engine, &mut session, "ZADD zset 1 a 2 b"), Reply::Integer(2));
    assert_eq!(ok(&engine, &mut session, "ZADD zset 3 a"), Reply::Integer(0));

    assert_eq!(ok(&engine, &mut session, "TYPE list"), Reply::Status("list".to_string()));
    assert_eq!(ok(&engine, &mut session, "TYPE set"), Reply::Status("set".to_string()));
    assert_eq!(ok(&engine, &mut session, "TYPE hash"), Reply::Status("hash".to_string()));
    assert_eq!(ok(&engine, &mut session, "TYPE zset"), Reply::Status("zset".to_string()));
}

#[test]
fn test_wrong_type_leaves_value_unchanged() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    ok(&engine, &mut session, "SET plain value");
    let before = engine.memory_counters();

    assert!(matches!(
        run(&engine, &mut session, "RPUSH plain x"),
        Err(EmberError::WrongType)
    ));
    ok(&engine, &mut session, "RPUSH list x");
    assert!(matches!(
        run(&engine, &mut session, "GET list"),
        Err(EmberError::WrongType)
    ));

    assert_eq!(ok(&engine, &mut session, "GET plain"), bulk("value"));
    // Only the new key "list" was charged to the string counter
    assert_eq!(
        engine.memory_counters().get(ObjectType::String),
        before.get(ObjectType::String) + 4 + 16
    );
}

#[test]
fn test_keys_and_select() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    ok(&engine, &mut session, "SET user:1 a");
    ok(&engine, &mut session, "SET user:2 b");
    ok(&engine, &mut session, "SET order:1 c");
    assert_eq!(
        ok(&engine, &mut session, "KEYS user:*"),
        Reply::Array(vec![bulk("user:1"), bulk("user:2")])
    );

    ok(&engine, &mut session, "SELECT 1");
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(0));
    assert_eq!(ok(&engine, &mut session, "KEYS *"), Reply::Array(Vec::new()));
    assert!(matches!(
        run(&engine, &mut session, "SELECT 16"),
        Err(EmberError::InvalidDb(16))
    ));
    assert_eq!(session.db(), 1);
}

#[test]
fn test_debug_populate() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    ok(&engine, &mut session, "SET key:1 custom");
    ok(&engine, &mut session, "DEBUG POPULATE 100");
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(100));
    assert_eq!(ok(&engine, &mut session, "GET key:1"), bulk("custom"));
    assert_eq!(
        ok(&engine, &mut session, "GET key:5"),
        bulk("value:5xxxxxxxxx")
    );

    ok(&engine, &mut session, "DEBUG POPULATE 10 item 4");
    assert_eq!(ok(&engine, &mut session, "GET item:7"), bulk("valu"));
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(110));
}

// =============================================================================
// INFO Tests
// =============================================================================

#[test]
fn test_info_memory_empty() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    let text = info_text(&engine, &mut session, "MEMORY");
    assert!(text.starts_with("# Memory\r\n"));
    assert_eq!(
        info_fields(&text),
        vec![("object_used_memory".to_string(), "0".to_string())]
    );
}

#[test]
fn test_info_memory_tracks_types() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    populate_all_types(&engine, &mut session);
    let text = info_text(&engine, &mut session, "MEMORY");
    for t in ["string", "list", "set", "hash", "zset"] {
        let value = info_field(&text, &format!("type_used_memory_{}", t))
            .unwrap_or_else(|| panic!("missing counter for {}", t));
        assert!(value.parse::<u64>().unwrap() > 0);
    }
    let total: u64 = info_field(&text, "object_used_memory").unwrap().parse().unwrap();
    assert_eq!(total, engine.memory_counters().total);

    ok(&engine, &mut session, "FLUSHALL");
    let text = info_text(&engine, &mut session, "MEMORY");
    assert_eq!(info_field(&text, "object_used_memory").as_deref(), Some("0"));
    assert_eq!(info_fields(&text).len(), 1);
}

#[test]
fn test_info_persistence_and_keyspace() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::Sharded);
    let mut session = Session::new();

    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_eq!(info_field(&text, "loading").as_deref(), Some("0"));
    assert_eq!(info_field(&text, "last_save_status").as_deref(), Some("none"));
    assert_eq!(info_field(&text, "last_save_format").as_deref(), Some("none"));
    assert_eq!(info_field(&text, "snapshot_cron").as_deref(), Some(""));

    populate_all_types(&engine, &mut session);
    ok(&engine, &mut session, "SAVE");

    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_eq!(info_field(&text, "last_save_status").as_deref(), Some("ok"));
    assert_eq!(info_field(&text, "last_save_format").as_deref(), Some("DF"));
    assert_eq!(
        info_field(&text, "last_save_file").as_deref(),
        Some("dump-summary.dfs")
    );
    assert_eq!(info_field(&text, "changes_since_last_save").as_deref(), Some("0"));

    let text = info_text(&engine, &mut session, "KEYSPACE");
    assert_eq!(
        info_fields(&text),
        vec![
            ("db0".to_string(), "keys=204".to_string()),
            ("db3".to_string(), "keys=1".to_string()),
        ]
    );

    let all = info_text(&engine, &mut session, "ALL");
    assert!(all.contains("# Persistence\r\n"));
    assert!(all.contains("\r\n\r\n# Memory\r\n"));
    assert!(all.contains("\r\n\r\n# Keyspace\r\n"));
}

// =============================================================================
// Save / Load Tests
// =============================================================================

fn reload_keeps_memory(format: SnapshotFormat) {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "test-reload", format);
    let mut session = Session::new();

    populate_all_types(&engine, &mut session);
    let before = engine.memory_counters();
    let job = engine.save().unwrap();
    let main = job.main_file().unwrap().to_string();

    ok(&engine, &mut session, "SET extra key");
    ok(&engine, &mut session, &format!("DEBUG LOAD {}", main));
    assert_eq!(engine.memory_counters(), before);
    assert_eq!(ok(&engine, &mut session, "GET extra"), Reply::Nil);
    let mut expected = b"value:7".to_vec();
    expected.resize(32, b'x');
    assert_eq!(ok(&engine, &mut session, "GET key:7"), Reply::Bulk(expected));
    drop(engine);

    // Startup autoload yields the same accounting
    let reopened = open_in(temp_dir.path(), "test-reload", format);
    assert_eq!(reopened.memory_counters(), before);
    assert_eq!(reopened.keyspace().len(), 205);
}

#[test]
fn test_reload_keeps_memory_single_file() {
    reload_keeps_memory(SnapshotFormat::SingleFile);
}

#[test]
fn test_reload_keeps_memory_sharded() {
    reload_keeps_memory(SnapshotFormat::Sharded);
}

#[test]
fn test_save_with_explicit_format_and_name() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::Sharded);
    let mut session = Session::new();

    ok(&engine, &mut session, "DEBUG POPULATE 10");
    ok(&engine, &mut session, "SAVE RDB custom");
    ok(&engine, &mut session, "SAVE DF custom");

    assert!(temp_dir.path().join("custom.rdb").is_file());
    assert!(temp_dir.path().join("custom-summary.dfs").is_file());
    assert!(temp_dir.path().join("custom-0003.dfs").is_file());
    assert!(run(&engine, &mut session, "SAVE XML").is_err());
}

#[test]
fn test_lastsave() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    assert_eq!(ok(&engine, &mut session, "LASTSAVE"), Reply::Integer(0));
    let before = Utc::now().timestamp();
    ok(&engine, &mut session, "SAVE");
    match ok(&engine, &mut session, "LASTSAVE") {
        Reply::Integer(at) => assert!(at >= before),
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_debug_load_glob_and_errors() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "test-dfs-{timestamp}", SnapshotFormat::Sharded);
    let mut session = Session::new();

    ok(&engine, &mut session, "DEBUG POPULATE 50");
    ok(&engine, &mut session, "SAVE");
    ok(&engine, &mut session, "FLUSHALL");

    ok(&engine, &mut session, "DEBUG LOAD test-dfs-*.dfs");
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(50));

    assert!(matches!(
        run(&engine, &mut session, "DEBUG LOAD nothing-*.rdb"),
        Err(EmberError::MainFileMissing(_))
    ));
    assert!(matches!(
        run(&engine, &mut session, "DEBUG LOAD ../../../../etc/passwd"),
        Err(EmberError::PathEscape(_))
    ));
    assert!(matches!(
        run(&engine, &mut session, "DEBUG LOAD /etc/passwd"),
        Err(EmberError::PathEscape(_))
    ));
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(50));
}

#[test]
fn test_concurrent_saves_are_exclusive() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Arc::new(open_in(temp_dir.path(), "dump", SnapshotFormat::Sharded));
    let mut session = Session::new();
    ok(&engine, &mut session, "DEBUG POPULATE 2000");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || run(&engine, &mut Session::new(), "SAVE"))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().any(|r| matches!(r, Ok(Reply::Ok))));
    for result in &results {
        assert!(matches!(result, Ok(Reply::Ok) | Err(EmberError::Busy)));
    }
    assert!(!engine.coordinator().is_saving());
}

// =============================================================================
// Containment Tests
// =============================================================================

#[test]
fn test_dbfilename_escape_rejected_at_open() {
    let temp_dir = TempDir::new().unwrap();
    let result = Engine::open(config_in(
        temp_dir.path(),
        "../../../../etc/passwd",
        SnapshotFormat::SingleFile,
    ));
    assert!(matches!(result, Err(EmberError::PathEscape(_))));
}

#[test]
fn test_staging_suffix_name_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let result = Engine::open(config_in(
        temp_dir.path(),
        "backup.tmp",
        SnapshotFormat::SingleFile,
    ));
    assert!(matches!(result, Err(EmberError::Config(_))));

    // A saved snapshot must survive the orphan sweep on the next start
    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();
    ok(&engine, &mut session, "SET marker v");
    assert!(matches!(
        run(&engine, &mut session, "SAVE RDB backup.tmp"),
        Err(EmberError::Config(_))
    ));
    assert!(!temp_dir.path().join("backup.tmp").exists());
    ok(&engine, &mut session, "SAVE");
    drop(engine);

    let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
    assert_eq!(ok(&engine, &mut Session::new(), "GET marker"), bulk("v"));
}

#[test]
fn test_save_filename_escape() {
    let parent = TempDir::new().unwrap();
    let dir = parent.path().join("data");
    let engine = open_in(&dir, "dump", SnapshotFormat::SingleFile);
    let mut session = Session::new();

    assert!(matches!(
        run(&engine, &mut session, "SAVE RDB ../outside"),
        Err(EmberError::PathEscape(_))
    ));
    assert!(!parent.path().join("outside.rdb").exists());

    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_eq!(info_field(&text, "last_save_status").as_deref(), Some("err"));
    assert!(info_field(&text, "last_save_error").is_some());
}

// =============================================================================
// Autoload Tests
// =============================================================================

fn autoload_case(dbfilename: &str, format: SnapshotFormat) {
    let temp_dir = TempDir::new().unwrap();
    let before = {
        let engine = open_in(temp_dir.path(), dbfilename, format);
        let mut session = Session::new();
        populate_all_types(&engine, &mut session);
        engine.save().unwrap();
        engine.memory_counters()
    };

    let engine = open_in(temp_dir.path(), dbfilename, format);
    let mut session = Session::new();
    assert_eq!(
        ok(&engine, &mut session, "DBSIZE"),
        Reply::Integer(204),
        "autoload of {} ({})",
        dbfilename,
        format
    );
    assert_eq!(engine.memory_counters(), before);
    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_eq!(info_field(&text, "changes_since_last_save").as_deref(), Some("0"));
}

#[test]
fn test_autoload_timestamped_single_file() {
    autoload_case("test-autoload1-{timestamp}", SnapshotFormat::SingleFile);
}

#[test]
fn test_autoload_timestamped_sharded() {
    autoload_case("test-autoload2-{timestamp}", SnapshotFormat::Sharded);
}

#[test]
fn test_autoload_explicit_rdb_extension() {
    autoload_case("test-autoload3.rdb", SnapshotFormat::SingleFile);
}

#[test]
fn test_autoload_bare_name_single_file() {
    autoload_case("test-autoload4", SnapshotFormat::SingleFile);
}

#[test]
fn test_autoload_bare_name_sharded() {
    autoload_case("test-autoload5", SnapshotFormat::Sharded);
}

#[test]
fn test_autoload_in_subdirectory() {
    autoload_case("nested/test-autoload6", SnapshotFormat::Sharded);
}

#[test]
fn test_autoload_ambiguous_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
        let mut session = Session::new();
        ok(&engine, &mut session, "DEBUG POPULATE 5");
        engine.save_as(SnapshotFormat::SingleFile).unwrap();
        engine.save_as(SnapshotFormat::Sharded).unwrap();
    }

    let result = Engine::open(config_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile));
    assert!(matches!(result, Err(EmberError::MainFileAmbiguous { .. })));
}

#[test]
fn test_empty_dbfilename_disables_autoload_and_shutdown_save() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = open_in(temp_dir.path(), "dump", SnapshotFormat::SingleFile);
        let mut session = Session::new();
        ok(&engine, &mut session, "DEBUG POPULATE 5");
        engine.save().unwrap();
    }

    let engine = open_in(temp_dir.path(), "", SnapshotFormat::SingleFile);
    let mut session = Session::new();
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(0));

    ok(&engine, &mut session, "SET k v");
    engine.shutdown();
    let files: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

// =============================================================================
// Shutdown / Cron Tests
// =============================================================================

#[test]
fn test_shutdown_saves() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = open_in(temp_dir.path(), "final", SnapshotFormat::Sharded);
        let mut session = Session::new();
        ok(&engine, &mut session, "DEBUG POPULATE 25");
        engine.shutdown();
    }
    assert!(temp_dir.path().join("final-summary.dfs").is_file());

    let engine = open_in(temp_dir.path(), "final", SnapshotFormat::Sharded);
    assert_eq!(engine.keyspace().len(), 25);
}

#[test]
fn test_cron_save() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .dir(temp_dir.path().to_str().unwrap())
        .dbfilename("test-cron")
        .snapshot_format(SnapshotFormat::Sharded)
        .snapshot_cron("* * * * *")
        .build();
    let engine = Engine::open(config).unwrap();
    let mut session = Session::new();
    ok(&engine, &mut session, "DEBUG POPULATE 10");

    assert!(engine.scheduler().fire_pending(Utc::now() + Duration::minutes(2)));
    assert!(wait_for(|| engine
        .backend()
        .exists("test-cron-summary.dfs")
        .unwrap_or(false)));
}

#[test]
fn test_invalid_cron_rejected_at_open() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .dir(temp_dir.path().to_str().unwrap())
        .snapshot_cron("61 * * * *")
        .build();
    assert!(matches!(
        Engine::open(config),
        Err(EmberError::InvalidCron { .. })
    ));
}

#[test]
fn test_config_get_set() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_in(temp_dir.path(), "dump-{timestamp}", SnapshotFormat::Sharded);
    let mut session = Session::new();

    assert_eq!(
        ok(&engine, &mut session, "CONFIG GET dbfilename"),
        Reply::Array(vec![bulk("dbfilename"), bulk("dump-{timestamp}")])
    );

    ok(&engine, &mut session, "CONFIG SET snapshot_cron */5 * * * *");
    assert_eq!(
        ok(&engine, &mut session, "CONFIG GET snapshot_cron"),
        Reply::Array(vec![bulk("snapshot_cron"), bulk("*/5 * * * *")])
    );
    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_ne!(info_field(&text, "next_save_time").as_deref(), Some("0"));

    assert!(matches!(
        run(&engine, &mut session, "CONFIG SET snapshot_cron \"every day\""),
        Err(EmberError::InvalidCron { .. })
    ));
    assert_eq!(
        engine.scheduler().schedule().expr(),
        Some("*/5 * * * *")
    );

    ok(&engine, &mut session, "CONFIG SET snapshot_cron \"\"");
    assert_eq!(engine.scheduler().schedule().expr(), None);

    assert!(matches!(
        run(&engine, &mut session, "CONFIG SET dir /tmp"),
        Err(EmberError::Config(_))
    ));
}

// =============================================================================
// Object Storage Tests
// =============================================================================

fn object_config(dbfilename: &str) -> Config {
    Config::builder()
        .dir("s3://bucket/prefix")
        .dbfilename(dbfilename)
        .snapshot_format(SnapshotFormat::Sharded)
        .build()
}

#[test]
fn test_object_storage_round_trip() {
    let client = Arc::new(InMemoryObjectClient::new());
    {
        let engine = Engine::open_with_client(
            object_config("dump"),
            Some(Arc::clone(&client) as Arc<dyn ObjectClient>),
        )
        .unwrap();
        let mut session = Session::new();
        ok(&engine, &mut session, "DEBUG POPULATE 40");
        ok(&engine, &mut session, "SAVE");
        ok(&engine, &mut session, "SAVE RDB backup");
    }
    assert_eq!(client.object_count("bucket"), 6);

    let engine = Engine::open_with_client(
        object_config("dump"),
        Some(Arc::clone(&client) as Arc<dyn ObjectClient>),
    )
    .unwrap();
    let mut session = Session::new();
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(40));

    ok(&engine, &mut session, "FLUSHALL");
    ok(&engine, &mut session, "DEBUG LOAD s3://bucket/prefix/backup.rdb");
    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(40));
    assert!(matches!(
        run(&engine, &mut session, "DEBUG LOAD s3://other/dump.rdb"),
        Err(EmberError::PathEscape(_))
    ));
    assert_eq!(
        ok(&engine, &mut session, "CONFIG GET dir"),
        Reply::Array(vec![bulk("dir"), bulk("s3://bucket/prefix")])
    );
}

#[test]
fn test_object_storage_requires_client() {
    assert!(matches!(
        Engine::open(object_config("dump")),
        Err(EmberError::Config(_))
    ));
}

/// Object client whose next `get_object` blocks until released
#[derive(Default)]
struct GatedClient {
    inner: InMemoryObjectClient,
    armed: AtomicBool,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedClient {
    fn arm(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.entered.lock().unwrap() = Some(entered_tx);
        *self.release.lock().unwrap() = Some(release_rx);
        self.armed.store(true, Ordering::SeqCst);
        (entered_rx, release_tx)
    }
}

impl ObjectClient for GatedClient {
    fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.inner.put_object(bucket, key, body)
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.entered.lock().unwrap().take() {
                let _ = tx.send(());
            }
            let rx = self.release.lock().unwrap().take();
            if let Some(rx) = rx {
                let _ = rx.recv();
            }
        }
        self.inner.get_object(bucket, key)
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_objects(bucket, prefix)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner.delete_object(bucket, key)
    }
}

#[test]
fn test_data_commands_refused_while_loading() {
    let client = Arc::new(GatedClient::default());
    let engine = Arc::new(
        Engine::open_with_client(
            object_config("dump"),
            Some(Arc::clone(&client) as Arc<dyn ObjectClient>),
        )
        .unwrap(),
    );
    let mut session = Session::new();
    ok(&engine, &mut session, "DEBUG POPULATE 30");
    ok(&engine, &mut session, "SAVE");
    ok(&engine, &mut session, "CONFIG SET snapshot_cron * * * * *");
    let saves_before = engine.coordinator().last_job().unwrap().id;

    let (entered, release) = client.arm();
    let load = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || run(&engine, &mut Session::new(), "DEBUG LOAD dump-summary.dfs"))
    };
    entered.recv().unwrap();

    assert!(matches!(
        run(&engine, &mut session, "GET key:1"),
        Err(EmberError::Loading)
    ));
    assert!(matches!(
        run(&engine, &mut session, "SET key:1 x"),
        Err(EmberError::Loading)
    ));
    assert_eq!(
        Reply::from(&EmberError::Loading),
        Reply::Error {
            code: "LOADING",
            message: "Dataset is loading".to_string()
        }
    );
    assert_eq!(ok(&engine, &mut session, "PING"), Reply::Status("PONG".to_string()));
    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_eq!(info_field(&text, "loading").as_deref(), Some("1"));

    // A scheduled save during the load is skipped
    assert!(engine.scheduler().fire_pending(Utc::now() + Duration::minutes(2)));
    assert_eq!(engine.coordinator().last_job().unwrap().id, saves_before);

    release.send(()).unwrap();
    assert_eq!(load.join().unwrap().unwrap(), Reply::Ok);

    assert_eq!(ok(&engine, &mut session, "DBSIZE"), Reply::Integer(30));
    let text = info_text(&engine, &mut session, "PERSISTENCE");
    assert_eq!(info_field(&text, "loading").as_deref(), Some("0"));
}

#[test]
fn test_save_refused_while_loading() {
    let client = Arc::new(GatedClient::default());
    let engine = Arc::new(
        Engine::open_with_client(
            object_config("dump"),
            Some(Arc::clone(&client) as Arc<dyn ObjectClient>),
        )
        .unwrap(),
    );
    let mut session = Session::new();
    ok(&engine, &mut session, "DEBUG POPULATE 30");
    ok(&engine, &mut session, "SAVE");
    let saves_before = engine.coordinator().last_job().unwrap().id;

    let (entered, release) = client.arm();
    let load = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || run(&engine, &mut Session::new(), "DEBUG LOAD dump-summary.dfs"))
    };
    entered.recv().unwrap();

    // The keyspace is flushed or half applied; nothing may capture it
    for line in ["SAVE", "SAVE RDB partial", "SAVE DF partial"] {
        assert!(
            matches!(run(&engine, &mut session, line), Err(EmberError::Loading)),
            "{} should be refused",
            line
        );
    }
    engine.shutdown();
    assert_eq!(engine.coordinator().last_job().unwrap().id, saves_before);

    release.send(()).unwrap();
    assert_eq!(load.join().unwrap().unwrap(), Reply::Ok);
    assert!(client
        .inner
        .list_objects("bucket", "prefix/partial")
        .unwrap()
        .is_empty());

    // Once the load finishes saves go through again
    ok(&engine, &mut session, "SAVE RDB after");
    assert_eq!(engine.coordinator().last_save().unwrap().keys, 30);
}
