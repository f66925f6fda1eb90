//! Command-line ingestion for memory-access history databases.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use memhist_core::MemoryAccess;
use memhist_store_sqlite::HistoryWriter;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memhist")]
#[command(version, about = "Memory-access history database tools")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a JSONL access trace into a new history database
    Ingest(IngestArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Trace file with one JSON access per line; `-` reads stdin
    #[arg(short, long)]
    trace: PathBuf,

    /// Path of the history database to create
    #[arg(short, long)]
    db: PathBuf,

    /// Tool name recorded in the database metadata
    #[arg(long, default_value = "memhist-cli")]
    tool_name: String,

    /// Tool version recorded in the database metadata
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    tool_version: String,

    /// Free-form tool description recorded in the database metadata
    #[arg(long, default_value = "memhist command-line ingest")]
    tool_info: String,

    /// Drop all accesses at or past this transition after ingestion
    #[arg(long)]
    truncate_at: Option<u64>,
}

#[derive(Serialize)]
struct IngestSummary {
    db: PathBuf,
    accesses: u64,
    truncated_at: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Ingest(args) => ingest(args),
    }
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .init();
}

fn ingest(args: IngestArgs) -> Result<()> {
    let mut writer =
        HistoryWriter::open(&args.db, &args.tool_name, &args.tool_version, &args.tool_info)
            .with_context(|| {
                format!("failed to create history database at {}", args.db.display())
            })?;

    let reader: Box<dyn BufRead> = if args.trace.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.trace)
            .with_context(|| format!("failed to open trace file {}", args.trace.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut accesses: u64 = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read trace line")?;
        if line.trim().is_empty() {
            continue;
        }
        let access: MemoryAccess = serde_json::from_str(&line)
            .with_context(|| format!("trace line {} is not a valid access", index + 1))?;
        writer
            .push(&access)
            .with_context(|| format!("failed to ingest access at trace line {}", index + 1))?;
        accesses += 1;
    }

    if let Some(transition) = args.truncate_at {
        writer
            .discard_after(transition)
            .with_context(|| format!("failed to truncate the recording at transition {transition}"))?;
    }

    writer.take().context("failed to finalize the history database")?;

    let summary = IngestSummary { db: args.db, accesses, truncated_at: args.truncate_at };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
