//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// docpack - content-addressed document archives
///
/// Packs files into ZIP archives, reusing a verified cached copy when the
/// same inputs were packed before.
#[derive(Parser, Debug)]
#[command(name = "docpack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "DOCPACK_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pack files into an archive
    Build(BuildArgs),

    /// Inspect and prune the archive cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Files, directories (packed recursively) or NAME=PATH pairs
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Where to write the archive
    #[arg(short, long)]
    pub output: PathBuf,

    /// Compression level 0-9 (default: from config)
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(0..=9))]
    pub level: Option<u32>,

    /// Store entries under their file names only
    #[arg(long)]
    pub flatten: bool,

    /// Drop entries over the size limit instead of failing
    #[arg(long)]
    pub skip_oversized: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Cache keys only, one per line
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached archives
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove expired archives and shrink the cache to its size cap
    Gc {
        /// Remove archives older than N days (default: from config)
        #[arg(long)]
        days: Option<u32>,

        /// Size cap in MB (default: from config)
        #[arg(long)]
        max_mb: Option<u64>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cached archive
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
