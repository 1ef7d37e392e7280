//! docdb CLI
//!
//! Command-line tools for docdb database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display collections, metadata and WAL segments
//! - `verify` - Check WAL lines, B-tree invariants and index entries
//! - `dump-wal` - Dump WAL records for debugging
//! - `checkpoint` - Apply the WAL and delete its segments
//! - `find` - Run a query against a collection

mod commands;

use clap::{Parser, Subcommand};
use commands::{CliError, OutputFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docdb command-line database tools.
#[derive(Parser)]
#[command(name = "docdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display collections, their metadata and WAL segments
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Verify database integrity
    Verify,

    /// Dump WAL records for debugging
    DumpWal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Replay the WAL into the document files and delete its segments
    Checkpoint,

    /// Query a collection
    Find {
        /// Collection name
        collection: String,

        /// Filter as JSON, e.g. '{"age": {"gte": 18}}'
        #[arg(default_value = "{}")]
        filter: String,

        /// Field to sort by
        #[arg(long)]
        order_by: Option<String>,

        /// Sort descending
        #[arg(long, requires = "order_by")]
        desc: bool,

        /// Number of matches to skip
        #[arg(long, default_value_t = 0)]
        skip: usize,

        /// Maximum number of matches
        #[arg(long)]
        limit: Option<usize>,

        /// Print the query plan instead of the results
        #[arg(long)]
        explain: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays clean.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = || cli.path.clone().ok_or(CliError::MissingPath);

    match cli.command {
        Commands::Inspect { format } => {
            commands::inspect::run(&path()?, format)?;
        }
        Commands::Verify => {
            commands::verify::run(&path()?)?;
        }
        Commands::DumpWal { limit, format } => {
            commands::dump_wal::run(&path()?, limit, format)?;
        }
        Commands::Checkpoint => {
            commands::checkpoint::run(&path()?)?;
        }
        Commands::Find {
            ref collection,
            ref filter,
            ref order_by,
            desc,
            skip,
            limit,
            explain,
        } => {
            let options = commands::find::FindOptions {
                order_by: order_by.clone(),
                descending: desc,
                skip,
                limit,
                explain,
            };
            commands::find::run(&path()?, collection, filter, &options)?;
        }
        Commands::Version => {
            println!("docdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("docdb core v{}", docdb_core::VERSION);
        }
    }

    Ok(())
}
