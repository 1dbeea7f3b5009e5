//! permalloc CLI
//!
//! Command-line tools for inspecting and maintaining permalloc datastores.
//!
//! # Commands
//!
//! - `ls` - List registered objects without mapping the heap
//! - `info` - Display identity, version and consistency
//! - `describe` - Set a datastore or object description
//! - `check` - Open read-only and walk the heap
//! - `snapshot` - Write a point-in-time copy with a new identity
//! - `copy` - Copy a closed datastore, keeping its identity
//! - `remove` - Delete a datastore

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use permalloc_core::ObjectKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// permalloc datastore tools.
#[derive(Parser)]
#[command(name = "permalloc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the datastore directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Object table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Named objects
    Named,
    /// Unique objects, keyed by type name
    Unique,
    /// Anonymous objects
    Anonymous,
    /// All three tables
    All,
}

impl KindArg {
    /// The object kinds this selector covers.
    pub fn kinds(self) -> &'static [ObjectKind] {
        match self {
            KindArg::Named => &[ObjectKind::Named],
            KindArg::Unique => &[ObjectKind::Unique],
            KindArg::Anonymous => &[ObjectKind::Anonymous],
            KindArg::All => &ObjectKind::ALL,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List registered objects
    Ls {
        /// Which table to list
        #[arg(short, long, value_enum, default_value = "all")]
        kind: KindArg,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display datastore identity, version and consistency
    Info {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Set the datastore description, or an object's with --object
    Describe {
        /// The description text
        text: String,

        /// Name of the object to describe
        #[arg(short, long)]
        object: Option<String>,

        /// Table the object lives in
        #[arg(short, long, value_enum, default_value = "named")]
        kind: KindArg,
    },

    /// Open read-only and verify the heap
    Check {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a point-in-time copy with a new identity
    Snapshot {
        /// Destination directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Copy a closed datastore, keeping its identity
    Copy {
        /// Destination directory
        #[arg(short, long)]
        output: PathBuf,

        /// Worker threads (0 = one per CPU)
        #[arg(short, long, default_value = "0")]
        threads: usize,
    },

    /// Delete a datastore
    Remove {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Ls { kind, format } => {
            let path = cli.path.ok_or("Datastore path required for ls")?;
            commands::ls::run(&path, kind, &format)?;
        }
        Commands::Info { format } => {
            let path = cli.path.ok_or("Datastore path required for info")?;
            commands::info::run(&path, &format)?;
        }
        Commands::Describe { text, object, kind } => {
            let path = cli.path.ok_or("Datastore path required for describe")?;
            commands::describe::run(&path, &text, object.as_deref(), kind)?;
        }
        Commands::Check { format } => {
            let path = cli.path.ok_or("Datastore path required for check")?;
            commands::check::run(&path, &format)?;
        }
        Commands::Snapshot { output } => {
            let path = cli.path.ok_or("Datastore path required for snapshot")?;
            commands::copy::snapshot(&path, &output)?;
        }
        Commands::Copy { output, threads } => {
            let path = cli.path.ok_or("Datastore path required for copy")?;
            commands::copy::copy(&path, &output, threads)?;
        }
        Commands::Remove { yes } => {
            let path = cli.path.ok_or("Datastore path required for remove")?;
            commands::remove::run(&path, yes)?;
        }
        Commands::Version => {
            println!("permalloc CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("permalloc core v{}", permalloc_core::VERSION);
            println!("on-disk format v{}", permalloc_core::FORMAT_VERSION);
        }
    }

    Ok(())
}
