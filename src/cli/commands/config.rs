//! Config command - show or initialize configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::ImgkeepResult;
use crate::ui::{self, UiContext};

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> ImgkeepResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => show_path(manager),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> ImgkeepResult<()> {
    let toml = toml::to_string_pretty(config)?;
    println!("{}", toml);
    println!("# effective cache dir: {}", config.cache.resolved_dir().display());
    Ok(())
}

fn show_path(manager: &ConfigManager) {
    println!("{}", manager.path().display());
}

async fn init_config(manager: &ConfigManager, force: bool) -> ImgkeepResult<()> {
    let ctx = UiContext::detect();
    manager.init(force).await?;
    ui::step_ok_detail(
        &ctx,
        "Configuration initialized",
        &manager.path().display().to_string(),
    );
    Ok(())
}
