//! Strata - operator command line
//!
//! Opens a data directory directly, so it must not run against a directory
//! a live server is writing to.
//!
//! ## Usage
//!
//! ```bash
//! # Append two events to a new stream
//! strata -d ./data append orders-1 --expected no-stream '{"total":12}' '{"total":7}'
//!
//! # Read them back, newest first
//! strata -d ./data read orders-1 --backward
//!
//! # Keep only the latest 100 events, then reclaim space
//! strata -d ./data metadata orders-1 --max-count 100
//! strata -d ./data scavenge
//!
//! # Walk the raw log and re-hash sealed chunks
//! strata -d ./data dump --max 50
//! strata -d ./data verify
//! ```

mod config;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::{Parser, Subcommand};
use strata_core::{ExpectedVersion, LogPosition, LogRecord, StreamMetadata};
use strata_logging::StrataSubscriberBuilder;
use strata_storage::{Database, NewEvent, ReadDirection};
use tracing::info;

use config::CliConfig;

/// Inspect and maintain a Strata data directory
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Inspect and maintain a Strata data directory")]
#[command(version)]
struct Cli {
    /// TOML configuration file with [db] and [log] tables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append events to a stream in one transaction
    Append {
        stream: String,
        /// Expected version: any, no-stream or an event number
        #[arg(long, default_value = "any")]
        expected: ExpectedVersion,
        /// Event type of every appended event
        #[arg(long = "type", default_value = "event")]
        event_type: String,
        /// Event payloads, one event each
        #[arg(required = true)]
        data: Vec<String>,
    },
    /// Read events of a stream
    Read {
        stream: String,
        /// First event number (default: start, or end when reading backward)
        #[arg(long)]
        from: Option<u64>,
        /// Maximum number of events
        #[arg(long, default_value_t = 100)]
        count: usize,
        /// Read newest first
        #[arg(long)]
        backward: bool,
    },
    /// Delete a stream for good
    Delete {
        stream: String,
        /// Expected version: any, no-stream or an event number
        #[arg(long, default_value = "any")]
        expected: ExpectedVersion,
    },
    /// Replace a stream's retention metadata
    Metadata {
        stream: String,
        /// Keep at most this many events
        #[arg(long)]
        max_count: Option<u64>,
        /// Keep events younger than this many seconds
        #[arg(long)]
        max_age: Option<u64>,
        /// Drop events numbered below this
        #[arg(long)]
        truncate_before: Option<u64>,
    },
    /// Print raw log records
    Dump {
        /// Log position to start at
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Maximum number of records
        #[arg(long, default_value_t = 1000)]
        max: usize,
    },
    /// List chunk files
    Chunks,
    /// Re-hash every sealed chunk
    Verify,
    /// Run one scavenge pass and print its summary as JSON
    Scavenge,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = CliConfig::load(cli.config.as_deref(), cli.data_dir)?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    let _guard = StrataSubscriberBuilder::new()
        .with_config(config.log.clone())
        .init();

    let db = Database::open(config.db.clone())
        .with_context(|| format!("opening {}", config.db.data_dir.display()))?;
    let result = run(&db, cli.command);
    db.close()?;
    result
}

fn run(db: &Database, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Append {
            stream,
            expected,
            event_type,
            data,
        } => {
            let events = data
                .into_iter()
                .map(|payload| NewEvent::new(event_type.clone(), payload))
                .collect();
            let result = db.append(&stream, expected, events)?;
            println!(
                "appended to {} from event {} (commit at {})",
                stream, result.first_event_number, result.position
            );
        }
        Commands::Read {
            stream,
            from,
            count,
            backward,
        } => {
            let (direction, from) = if backward {
                (ReadDirection::Backward, from.unwrap_or(u64::MAX))
            } else {
                (ReadDirection::Forward, from.unwrap_or(0))
            };
            let slice = db.read_stream(&stream, from, count, direction)?;
            for event in &slice.events {
                println!(
                    "{}@{} {} {} {}",
                    event.event_number,
                    event.stream,
                    event.position,
                    event.event_type,
                    preview(&event.data)
                );
            }
            println!(
                "-- {} events, last event {}, end of stream: {}",
                slice.events.len(),
                slice.last_event_number,
                slice.is_end_of_stream
            );
        }
        Commands::Delete { stream, expected } => {
            let position = db.delete_stream(&stream, expected)?;
            println!("deleted {} (tombstone at {})", stream, position);
        }
        Commands::Metadata {
            stream,
            max_count,
            max_age,
            truncate_before,
        } => {
            let metadata = StreamMetadata {
                max_count,
                max_age: max_age.map(std::time::Duration::from_secs),
                truncate_before,
            };
            db.set_stream_metadata(&stream, ExpectedVersion::Any, metadata)?;
            println!("metadata of {} set", stream);
        }
        Commands::Dump { from, max } => {
            for recorded in db.read_all_forward(LogPosition::new(from), max)? {
                println!("{} {}", recorded.position, describe(&recorded.record));
            }
        }
        Commands::Chunks => {
            for chunk in db.log().chunks() {
                println!(
                    "chunk {:>6} v{} {:<6} {:>10} bytes{}",
                    chunk.number(),
                    chunk.file_version(),
                    if chunk.is_sealed() { "sealed" } else { "active" },
                    chunk.physical_data_size(),
                    if chunk.is_scavenged() { " scavenged" } else { "" }
                );
            }
            println!(
                "-- writer checkpoint {}, chaser checkpoint {}",
                db.log().writer_checkpoint(),
                db.log().chaser_checkpoint()
            );
        }
        Commands::Verify => {
            let verified = db.log().verify()?;
            println!("verified {} sealed chunks", verified);
        }
        Commands::Scavenge => {
            let result = db.scavenge(&AtomicBool::new(false))?;
            info!(rewritten = result.chunks_rewritten, "Scavenge finished");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

/// One-line description of a raw record
fn describe(record: &LogRecord) -> String {
    match record {
        LogRecord::Prepare(p) => format!(
            "prepare {} #{} {} {:?} {} {}",
            p.transaction_id,
            p.transaction_offset,
            p.stream,
            p.flags,
            p.event_type,
            preview(&p.data)
        ),
        LogRecord::Commit(c) if c.is_tombstone() => {
            format!("commit {} tombstone for {}", c.transaction_id, c.transaction_position)
        }
        LogRecord::Commit(c) => format!(
            "commit {} of {} first event {}",
            c.transaction_id, c.transaction_position, c.first_event_number
        ),
        LogRecord::System(s) => format!("system {:?}", s.kind),
    }
}

/// Payload as text when it is short UTF-8, hex otherwise
fn preview(data: &[u8]) -> String {
    const LIMIT: usize = 64;
    match std::str::from_utf8(data) {
        Ok(text) if text.len() <= LIMIT => format!("{:?}", text),
        _ if data.len() <= LIMIT / 2 => hex::encode(data),
        _ => format!("{}.. ({} bytes)", hex::encode(&data[..LIMIT / 2]), data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage::DbConfig;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Database {
        Database::open(DbConfig::with_data_dir(dir.path()).with_chunk_size(64 * 1024)).unwrap()
    }

    #[test]
    fn test_parse_append() {
        let cli = Cli::try_parse_from([
            "strata", "-d", "/tmp/x", "append", "orders", "--expected", "no-stream", "a", "b",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        match cli.command {
            Commands::Append { expected, data, .. } => {
                assert_eq!(expected, ExpectedVersion::NoStream);
                assert_eq!(data, vec!["a", "b"]);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_expected_version() {
        assert!(Cli::try_parse_from(["strata", "delete", "s", "--expected", "soon"]).is_err());
    }

    #[test]
    fn test_commands_against_database() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        run(
            &db,
            Commands::Append {
                stream: "orders".into(),
                expected: ExpectedVersion::NoStream,
                event_type: "placed".into(),
                data: vec!["one".into(), "two".into()],
            },
        )
        .unwrap();
        assert_eq!(db.last_event_number("orders"), Some(1));

        run(
            &db,
            Commands::Metadata {
                stream: "orders".into(),
                max_count: Some(1),
                max_age: None,
                truncate_before: None,
            },
        )
        .unwrap();
        assert_eq!(db.stream_metadata("orders").max_count, Some(1));

        run(&db, Commands::Dump { from: 0, max: 10 }).unwrap();
        run(&db, Commands::Verify).unwrap();
        run(&db, Commands::Scavenge).unwrap();

        run(
            &db,
            Commands::Delete {
                stream: "orders".into(),
                expected: ExpectedVersion::Exact(1),
            },
        )
        .unwrap();
        let read = run(
            &db,
            Commands::Read {
                stream: "orders".into(),
                from: None,
                count: 10,
                backward: false,
            },
        );
        assert!(read.is_err());
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview(b"hello"), "\"hello\"");
        assert_eq!(preview(&[0xff, 0x00]), "ff00");
        assert!(preview(&[0xffu8; 100]).ends_with("(100 bytes)"));
    }
}
