//! imgkeep - offline image cache for Markdown documents
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use imgkeep::cli::args::{ConfigAction, ConfigArgs};
use imgkeep::cli::commands;
use imgkeep::cli::{Cli, Commands};
use imgkeep::config::{Config, ConfigManager, LogFormat};
use imgkeep::error::ImgkeepResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ImgkeepResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    // Init must work even when the existing file no longer parses
    let config = match cli.command {
        Commands::Config(ConfigArgs {
            action: Some(ConfigAction::Init { .. }),
        }) => Config::default(),
        _ => config_manager.load().await?,
    };

    // 0 = warn (spinners only), 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("imgkeep=warn"),
        1 => EnvFilter::new("imgkeep=info"),
        _ => EnvFilter::new("imgkeep=debug"),
    };

    match cli.log_format.unwrap_or(config.general.log_format) {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    debug!(path = %config_manager.path().display(), "loaded configuration");

    imgkeep::ui::init_theme();

    match cli.command {
        Commands::Sync(args) => commands::sync(args, &config).await,
        Commands::List(args) => commands::list(args, &config).await,
        Commands::Forget(args) => commands::forget(args, &config).await,
        Commands::Rename(args) => commands::rename(args, &config).await,
        Commands::Gc => commands::gc(&config).await,
        Commands::Verify => commands::verify(&config).await,
        Commands::Clear(args) => commands::clear(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}
