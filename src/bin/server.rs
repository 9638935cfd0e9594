//! EmberKV Server Binary
//!
//! Opens the engine and serves commands from a line-oriented console on
//! stdin. `SHUTDOWN` or end of input saves and exits.

use std::io::{self, BufRead, Write};

use clap::Parser;
use emberkv::protocol::{render_reply, split_args, Command, Reply};
use emberkv::snapshot::SnapshotFormat;
use emberkv::{Config, Engine, Session};
use tracing_subscriber::{fmt, EnvFilter};

/// EmberKV Server
#[derive(Parser, Debug)]
#[command(name = "emberkv-server")]
#[command(about = "In-memory key-value store with point-in-time snapshots")]
#[command(version)]
struct Args {
    /// Snapshot directory, or s3://bucket/prefix
    #[arg(short, long, default_value = "./emberkv_data")]
    dir: String,

    /// Snapshot filename template; may contain {timestamp}, empty disables autoload
    #[arg(long, default_value = "dump-{timestamp}")]
    dbfilename: String,

    /// Cron expression for scheduled saves, e.g. "*/15 * * * *"
    #[arg(long)]
    snapshot_cron: Option<String>,

    /// Default snapshot format: RDB (single file) or DF (sharded)
    #[arg(short, long, default_value = "DF")]
    format: SnapshotFormat,

    /// Number of keyspace shards
    #[arg(short, long, default_value = "4")]
    shards: usize,

    /// Number of logical databases
    #[arg(long, default_value = "16")]
    databases: usize,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,emberkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("EmberKV Server v{}", emberkv::VERSION);
    tracing::info!("Snapshot directory: {}", args.dir);

    // Build config from args
    let mut builder = Config::builder()
        .dir(&args.dir)
        .dbfilename(&args.dbfilename)
        .snapshot_format(args.format)
        .shard_count(args.shards)
        .db_count(args.databases);
    if let Some(cron) = &args.snapshot_cron {
        builder = builder.snapshot_cron(cron);
    }
    let config = builder.build();

    // Open engine (autoload happens here)
    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Engine initialized successfully");

    if let Err(e) = serve(&engine) {
        tracing::error!("Console error: {}", e);
    }

    engine.shutdown();
    tracing::info!("Server stopped");
}

/// Read commands until `SHUTDOWN` or end of input
fn serve(engine: &Engine) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut session = Session::new();

    for line in stdin.lock().lines() {
        let args = match split_args(&line?) {
            Ok(args) if args.is_empty() => continue,
            Ok(args) => args,
            Err(e) => {
                writeln!(stdout, "{}", render_reply(&Reply::from(&e)))?;
                continue;
            }
        };

        if args[0].eq_ignore_ascii_case(b"SHUTDOWN") || args[0].eq_ignore_ascii_case(b"QUIT") {
            break;
        }

        let reply = Command::parse(&args)
            .and_then(|command| engine.execute(&mut session, command))
            .unwrap_or_else(|e| {
                tracing::debug!(command = %String::from_utf8_lossy(&args[0]), error = %e, "Command failed");
                Reply::from(&e)
            });
        writeln!(stdout, "{}", render_reply(&reply))?;
        stdout.flush()?;
    }
    Ok(())
}
