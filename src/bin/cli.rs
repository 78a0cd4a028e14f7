//! Keyhive CLI
//!
//! Command-line interface for inspecting and editing a Keyhive store.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use keyhive::{Engine, Options, SyncStrategy};
use tracing_subscriber::{fmt, EnvFilter};

/// Keyhive CLI
#[derive(Parser, Debug)]
#[command(name = "keyhive")]
#[command(about = "Embedded store of unique keys")]
#[command(version)]
struct Args {
    /// Store directory
    #[arg(short, long, default_value = "./keyhive_data")]
    dir: String,

    /// Segment rotation threshold in MB
    #[arg(long)]
    max_segment_mb: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add keys (from arguments, or one per line on stdin)
    Put {
        keys: Vec<String>,
    },

    /// Check whether keys exist
    Has {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Print the number of keys
    Count,

    /// Print every key
    Scan,

    /// Compact fragmented segments
    Compact {
        /// Minimum fragmentation ratio of a segment to rewrite
        #[arg(long, default_value = "0.5")]
        min_fragmentation: f32,
    },

    /// Print store statistics
    Stats,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keyhive=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> keyhive::Result<()> {
    let mut builder = Options::builder().sync_strategy(SyncStrategy::Manual);
    if let Some(mb) = args.max_segment_mb {
        builder = builder.max_segment_size(mb.saturating_mul(1024 * 1024));
    }
    if let Commands::Compact { min_fragmentation } = args.command {
        builder = builder
            .compaction_min_fragmentation(min_fragmentation)
            .compaction_min_segment_size(0);
    }

    let engine = Engine::open(&args.dir, builder.build())?;
    if let Some(report) = engine.recovery_report() {
        tracing::warn!(?report, "recovered after unclean shutdown");
    }

    let result = execute(&engine, args.command);
    let closed = engine.close();
    result.and(closed)
}

fn execute(engine: &Engine, command: Commands) -> keyhive::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match command {
        Commands::Put { keys } => {
            let mut added = 0u64;
            if keys.is_empty() {
                for line in io::stdin().lock().lines() {
                    if !engine.has_or_put(line?.as_bytes())? {
                        added += 1;
                    }
                }
            } else {
                for key in &keys {
                    if !engine.has_or_put(key.as_bytes())? {
                        added += 1;
                    }
                }
            }
            engine.sync()?;
            writeln!(out, "added {} keys", added)?;
        }
        Commands::Has { keys } => {
            for key in &keys {
                writeln!(out, "{}\t{}", key, engine.has(key.as_bytes())?)?;
            }
        }
        Commands::Count => {
            writeln!(out, "{}", engine.count())?;
        }
        Commands::Scan => {
            for key in engine.items() {
                writeln!(out, "{}", String::from_utf8_lossy(&key?))?;
            }
        }
        Commands::Compact { .. } => {
            let result = engine.compact()?;
            writeln!(
                out,
                "compacted {} segments, reclaimed {} records ({} bytes)",
                result.compacted_segments, result.reclaimed_records, result.reclaimed_bytes
            )?;
        }
        Commands::Stats => {
            writeln!(out, "path:       {}", engine.path().display())?;
            writeln!(out, "keys:       {}", engine.count())?;
            writeln!(out, "file size:  {} bytes", engine.file_size()?)?;
            writeln!(out, "version:    {}", keyhive::VERSION)?;
        }
    }
    Ok(())
}
