//! Command definitions
//!
//! Represents commands from clients, parsed from tokenized arguments.

use crate::error::{EmberError, Result};
use crate::snapshot::SnapshotFormat;

/// Default key prefix for `DEBUG POPULATE`
pub const DEFAULT_POPULATE_PREFIX: &str = "key";

/// Default value size for `DEBUG POPULATE`
pub const DEFAULT_POPULATE_SIZE: usize = 16;

/// `INFO` sections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSection {
    Persistence,
    Memory,
    Keyspace,
}

impl InfoSection {
    pub const ALL: [InfoSection; 3] = [
        InfoSection::Persistence,
        InfoSection::Memory,
        InfoSection::Keyspace,
    ];

    /// Header line name
    pub fn title(&self) -> &'static str {
        match self {
            InfoSection::Persistence => "Persistence",
            InfoSection::Memory => "Memory",
            InfoSection::Keyspace => "Keyspace",
        }
    }
}

/// Parameters reachable through `CONFIG`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParam {
    SnapshotCron,
    Dir,
    DbFilename,
}

impl ConfigParam {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigParam::SnapshotCron => "snapshot_cron",
            ConfigParam::Dir => "dir",
            ConfigParam::DbFilename => "dbfilename",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "snapshot_cron" => Ok(ConfigParam::SnapshotCron),
            "dir" => Ok(ConfigParam::Dir),
            "dbfilename" => Ok(ConfigParam::DbFilename),
            other => Err(EmberError::Protocol(format!(
                "unknown config parameter '{}'",
                other
            ))),
        }
    }
}

/// A parsed command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------
    /// Health check, optionally echoing a message
    Ping { message: Option<Vec<u8>> },

    /// Switch the session's logical database
    Select { db: usize },

    // -------------------------------------------------------------------------
    // Keyspace
    // -------------------------------------------------------------------------
    Set { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Del { keys: Vec<Vec<u8>> },
    Exists { keys: Vec<Vec<u8>> },
    Type { key: Vec<u8> },
    Keys { pattern: Vec<u8> },
    DbSize,
    FlushAll,
    RPush { key: Vec<u8>, values: Vec<Vec<u8>> },
    SAdd { key: Vec<u8>, members: Vec<Vec<u8>> },
    HSet { key: Vec<u8>, pairs: Vec<(Vec<u8>, Vec<u8>)> },
    ZAdd { key: Vec<u8>, entries: Vec<(f64, Vec<u8>)> },

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------
    /// Save now; defaults to the configured format and `dbfilename`
    Save {
        format: Option<SnapshotFormat>,
        filename: Option<String>,
    },

    /// Unix time of the last successful save
    LastSave,

    /// Replace the dataset with a snapshot
    DebugLoad { path: String },

    /// Create `count` string keys named `<prefix>:<n>`
    DebugPopulate {
        count: usize,
        prefix: String,
        size: usize,
    },

    // -------------------------------------------------------------------------
    // Server
    // -------------------------------------------------------------------------
    ConfigGet { param: ConfigParam },
    ConfigSet { param: ConfigParam, value: String },

    /// `None` reports every section
    Info { section: Option<InfoSection> },
}

impl Command {
    /// Parse a tokenized command line
    pub fn parse(args: &[Vec<u8>]) -> Result<Self> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| EmberError::Protocol("empty command".to_string()))?;
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match name.as_str() {
            "PING" => {
                arity(&name, rest, 0, Some(1))?;
                Ok(Command::Ping {
                    message: rest.first().map(|m| bytes(m)),
                })
            }
            "SELECT" => {
                arity(&name, rest, 1, Some(1))?;
                Ok(Command::Select {
                    db: number(&rest[0])?,
                })
            }
            "SET" => {
                arity(&name, rest, 2, Some(2))?;
                Ok(Command::Set {
                    key: bytes(&rest[0]),
                    value: bytes(&rest[1]),
                })
            }
            "GET" => {
                arity(&name, rest, 1, Some(1))?;
                Ok(Command::Get { key: bytes(&rest[0]) })
            }
            "DEL" => {
                arity(&name, rest, 1, None)?;
                Ok(Command::Del {
                    keys: rest.iter().map(|k| bytes(k)).collect(),
                })
            }
            "EXISTS" => {
                arity(&name, rest, 1, None)?;
                Ok(Command::Exists {
                    keys: rest.iter().map(|k| bytes(k)).collect(),
                })
            }
            "TYPE" => {
                arity(&name, rest, 1, Some(1))?;
                Ok(Command::Type { key: bytes(&rest[0]) })
            }
            "KEYS" => {
                arity(&name, rest, 1, Some(1))?;
                Ok(Command::Keys {
                    pattern: bytes(&rest[0]),
                })
            }
            "DBSIZE" => {
                arity(&name, rest, 0, Some(0))?;
                Ok(Command::DbSize)
            }
            "FLUSHALL" => {
                arity(&name, rest, 0, Some(0))?;
                Ok(Command::FlushAll)
            }
            "RPUSH" => {
                arity(&name, rest, 2, None)?;
                Ok(Command::RPush {
                    key: bytes(&rest[0]),
                    values: rest[1..].iter().map(|v| bytes(v)).collect(),
                })
            }
            "SADD" => {
                arity(&name, rest, 2, None)?;
                Ok(Command::SAdd {
                    key: bytes(&rest[0]),
                    members: rest[1..].iter().map(|m| bytes(m)).collect(),
                })
            }
            "HSET" => {
                arity(&name, rest, 3, None)?;
                let pairs = pairs(&name, &rest[1..])?
                    .map(|(field, value)| (bytes(field), bytes(value)))
                    .collect();
                Ok(Command::HSet {
                    key: bytes(&rest[0]),
                    pairs,
                })
            }
            "ZADD" => {
                arity(&name, rest, 3, None)?;
                let entries = pairs(&name, &rest[1..])?
                    .map(|(score, member)| Ok((score_value(score)?, bytes(member))))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Command::ZAdd {
                    key: bytes(&rest[0]),
                    entries,
                })
            }
            "SAVE" => {
                arity(&name, rest, 0, Some(2))?;
                Ok(Command::Save {
                    format: rest
                        .first()
                        .map(|f| text(f)?.parse::<SnapshotFormat>())
                        .transpose()?,
                    filename: rest.get(1).map(|f| owned_text(f)).transpose()?,
                })
            }
            "LASTSAVE" => {
                arity(&name, rest, 0, Some(0))?;
                Ok(Command::LastSave)
            }
            "DEBUG" => Self::parse_debug(rest),
            "CONFIG" => Self::parse_config(rest),
            "INFO" => {
                arity(&name, rest, 0, Some(1))?;
                let section = match rest
                    .first()
                    .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase())
                {
                    None => None,
                    Some(s) if s == "ALL" || s == "EVERYTHING" => None,
                    Some(s) => Some(match s.as_str() {
                        "PERSISTENCE" => InfoSection::Persistence,
                        "MEMORY" => InfoSection::Memory,
                        "KEYSPACE" => InfoSection::Keyspace,
                        other => {
                            return Err(EmberError::Protocol(format!(
                                "unknown INFO section '{}'",
                                other
                            )))
                        }
                    }),
                };
                Ok(Command::Info { section })
            }
            other => Err(EmberError::Protocol(format!("unknown command '{}'", other))),
        }
    }

    /// Commands that only touch the dataset
    ///
    /// These are refused while a snapshot is loading.
    pub fn is_data_command(&self) -> bool {
        !matches!(
            self,
            Command::Ping { .. }
                | Command::Save { .. }
                | Command::LastSave
                | Command::ConfigGet { .. }
                | Command::ConfigSet { .. }
                | Command::Info { .. }
        )
    }

    fn parse_debug(args: &[Vec<u8>]) -> Result<Self> {
        let (sub, rest) = args
            .split_first()
            .ok_or_else(|| EmberError::Protocol("DEBUG requires a subcommand".to_string()))?;
        let sub = String::from_utf8_lossy(sub).to_ascii_uppercase();

        match sub.as_str() {
            "LOAD" => {
                arity("DEBUG LOAD", rest, 1, Some(1))?;
                Ok(Command::DebugLoad {
                    path: owned_text(&rest[0])?,
                })
            }
            "POPULATE" => {
                arity("DEBUG POPULATE", rest, 1, Some(3))?;
                Ok(Command::DebugPopulate {
                    count: number(&rest[0])?,
                    prefix: rest
                        .get(1)
                        .map(|p| owned_text(p))
                        .transpose()?
                        .unwrap_or_else(|| DEFAULT_POPULATE_PREFIX.to_string()),
                    size: rest
                        .get(2)
                        .map(|s| number(s))
                        .transpose()?
                        .unwrap_or(DEFAULT_POPULATE_SIZE),
                })
            }
            other => Err(EmberError::Protocol(format!(
                "unknown DEBUG subcommand '{}'",
                other
            ))),
        }
    }

    fn parse_config(args: &[Vec<u8>]) -> Result<Self> {
        let (sub, rest) = args
            .split_first()
            .ok_or_else(|| EmberError::Protocol("CONFIG requires a subcommand".to_string()))?;
        let sub = String::from_utf8_lossy(sub).to_ascii_uppercase();

        match sub.as_str() {
            "GET" => {
                arity("CONFIG GET", rest, 1, Some(1))?;
                Ok(Command::ConfigGet {
                    param: ConfigParam::parse(text(&rest[0])?)?,
                })
            }
            "SET" => {
                // A cron expression may arrive unquoted, spread over several args
                arity("CONFIG SET", rest, 2, None)?;
                Ok(Command::ConfigSet {
                    param: ConfigParam::parse(text(&rest[0])?)?,
                    value: rest[1..]
                        .iter()
                        .map(|arg| text(arg))
                        .collect::<Result<Vec<_>>>()?
                        .join(" "),
                })
            }
            other => Err(EmberError::Protocol(format!(
                "unknown CONFIG subcommand '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Argument Helpers
// =============================================================================

fn arity(name: &str, args: &[Vec<u8>], min: usize, max: Option<usize>) -> Result<()> {
    if args.len() < min || max.map_or(false, |max| args.len() > max) {
        return Err(EmberError::Protocol(format!(
            "wrong number of arguments for '{}'",
            name.to_ascii_lowercase()
        )));
    }
    Ok(())
}

fn bytes(arg: &[u8]) -> Vec<u8> {
    arg.to_vec()
}

/// Names, paths and config values must be UTF-8; keys and values need not be
fn text(arg: &[u8]) -> Result<&str> {
    std::str::from_utf8(arg).map_err(|_| {
        EmberError::Protocol(format!(
            "argument is not valid UTF-8: '{}'",
            String::from_utf8_lossy(arg)
        ))
    })
}

fn owned_text(arg: &[u8]) -> Result<String> {
    text(arg).map(str::to_string)
}

fn number(arg: &[u8]) -> Result<usize> {
    let arg = String::from_utf8_lossy(arg);
    arg.parse()
        .map_err(|_| EmberError::Protocol(format!("value is not an integer: '{}'", arg)))
}

fn score_value(arg: &[u8]) -> Result<f64> {
    let arg = String::from_utf8_lossy(arg);
    match arg.parse::<f64>() {
        Ok(score) if !score.is_nan() => Ok(score),
        _ => Err(EmberError::Protocol(format!("value is not a valid float: '{}'", arg))),
    }
}

fn pairs<'a>(
    name: &str,
    args: &'a [Vec<u8>],
) -> Result<impl Iterator<Item = (&'a [u8], &'a [u8])>> {
    if args.len() % 2 != 0 {
        return Err(EmberError::Protocol(format!(
            "wrong number of arguments for '{}'",
            name.to_ascii_lowercase()
        )));
    }
    Ok(args
        .chunks_exact(2)
        .map(|pair| (pair[0].as_slice(), pair[1].as_slice())))
}
