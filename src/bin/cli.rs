//! nvtier CLI
//!
//! Command-line access to an nvtier data directory.

use clap::{Parser, Subcommand};
use nvtier::format::{parse_internal_key, ValueKind};
use nvtier::{Config, Engine, EntryIterator, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// nvtier CLI
#[derive(Parser, Debug)]
#[command(name = "nvtier-cli")]
#[command(about = "CLI for the nvtier persistent write tier")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./nvtier_data")]
    data_dir: String,

    /// Number of shards (only used when creating a data directory)
    #[arg(short = 'n', long, default_value = "8")]
    shards: usize,

    /// Logical index arena size per shard in MB
    #[arg(long, default_value = "16")]
    index_mb: usize,

    /// Logical log size per shard in MB
    #[arg(long, default_value = "64")]
    log_mb: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Print every entry in key order
    Scan,

    /// Print per-shard usage
    Stats,

    /// Drain over-threshold shards, printing their entries
    Drain,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nvtier=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .num_shards(args.shards)
        .index_region_size(args.index_mb * 1024 * 1024)
        .log_region_size(args.log_mb * 1024 * 1024)
        .index_drain_threshold(args.index_mb * 1024 * 1024)
        .log_drain_threshold(args.log_mb * 1024 * 1024)
        .build();

    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = run(&engine, args.command).and_then(|_| engine.close());
    if let Err(e) = outcome {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            let seq = engine.put(key.as_bytes(), value.as_bytes())?;
            println!("OK (seq {})", seq);
        }
        Commands::Del { key } => {
            let seq = engine.delete(key.as_bytes())?;
            println!("OK (seq {})", seq);
        }
        Commands::Scan => {
            let mut iter = engine.iter();
            iter.seek_to_first()?;
            while iter.valid() {
                print_entry(iter.key(), iter.value())?;
                iter.next()?;
            }
        }
        Commands::Stats => {
            println!("last sequence: {}", engine.last_sequence());
            for s in engine.stats() {
                println!(
                    "shard {:>3}: {:>8} entries, index {:>10} bytes, log {:>10} bytes, filter {}",
                    s.index,
                    s.entries,
                    s.index_bytes,
                    s.log_bytes,
                    if s.filter_trusted { "trusted" } else { "untrusted" }
                );
            }
        }
        Commands::Drain => {
            let drained = engine.drain(|index, iter| {
                while iter.valid() {
                    print!("[shard {}] ", index);
                    print_entry(iter.key(), iter.value())?;
                    iter.next()?;
                }
                Ok(())
            })?;
            println!("drained {} shards", drained.len());
        }
    }
    Ok(())
}

fn print_entry(internal_key: &[u8], value: &[u8]) -> Result<()> {
    let (user_key, seq, kind) = parse_internal_key(internal_key)?;
    let key = String::from_utf8_lossy(user_key);
    match kind {
        ValueKind::Value => println!("{} @{} = {}", key, seq, String::from_utf8_lossy(value)),
        ValueKind::Deletion => println!("{} @{} (deleted)", key, seq),
    }
    Ok(())
}
