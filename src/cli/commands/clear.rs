//! Clear command - delete every cached image

use crate::cli::args::ClearArgs;
use crate::cli::commands::open_store;
use crate::config::Config;
use crate::error::ImgkeepResult;
use crate::ui::{self, UiContext};

/// Execute the clear command
pub async fn execute(args: ClearArgs, config: &Config) -> ImgkeepResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let store = open_store(config).await?;
    let stats = store.stats().await;

    if stats.items == 0 {
        store.close().await?;
        ui::step_info(&ctx, "Cache is already empty");
        return Ok(());
    }

    let question = format!(
        "Delete {} cached image(s) and forget {} document(s)?",
        stats.items, stats.retainers
    );
    if !ui::confirm(&ctx, &question, false).await? {
        store.close().await?;
        ui::step_info(&ctx, "Cancelled");
        return Ok(());
    }

    let removed = store.clear_all().await?;
    store.close().await?;
    ui::outro_success(&ctx, &format!("Removed {} file(s)", removed));
    Ok(())
}
