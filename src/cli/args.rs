//! CLI argument definitions using clap derive

use crate::config::LogFormat;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// imgkeep - keep remote images referenced by Markdown documents cached
/// locally, and drop them when no document needs them any more.
#[derive(Parser, Debug)]
#[command(name = "imgkeep")]
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
    #[arg(short, long, global = true, env = "IMGKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format (overrides general.log_format)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile documents with the cache, downloading what they reference
    Sync(SyncArgs),

    /// List cached images
    List(ListArgs),

    /// Release every image a document holds
    Forget(ForgetArgs),

    /// Move a document's references to its new path
    Rename(RenameArgs),

    /// Delete images no document references
    Gc,

    /// Repair the cache directory against its metadata
    Verify,

    /// Delete every cached image
    Clear(ClearArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the sync command
#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Markdown documents to reconcile
    #[arg(required = true)]
    pub documents: Vec<PathBuf>,

    /// Output format for the per-document summary
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the forget command
#[derive(Parser, Debug)]
pub struct ForgetArgs {
    /// Document whose references are released
    pub document: PathBuf,
}

/// Arguments for the rename command
#[derive(Parser, Debug)]
pub struct RenameArgs {
    /// Previous document path
    pub from: PathBuf,

    /// New document path
    pub to: PathBuf,
}

/// Arguments for the clear command
#[derive(Parser, Debug)]
pub struct ClearArgs {
    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
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

    /// Write a default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
