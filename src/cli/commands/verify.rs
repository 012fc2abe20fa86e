//! Verify command - repair the cache directory

use crate::cli::commands::open_store;
use crate::config::Config;
use crate::error::ImgkeepResult;
use crate::ui::{self, UiContext};

/// Execute the verify command
pub async fn execute(config: &Config) -> ImgkeepResult<()> {
    let ctx = UiContext::detect();
    let store = open_store(config).await?;
    let report = store.verify().await?;
    store.close().await?;

    if report.is_clean() {
        ui::step_ok(&ctx, "Cache is consistent");
        ui::key_value(&ctx, "directory", &store.layout().dir().display().to_string());
        return Ok(());
    }

    for key in &report.missing_blobs {
        ui::step_warn_hint(&ctx, &format!("Dropped entry {}", key), "blob was missing");
    }
    for name in &report.orphan_files {
        ui::step_warn_hint(&ctx, &format!("Removed {}", name), "no entry owned it");
    }
    if report.dangling_refs > 0 {
        ui::step_warn_hint(
            &ctx,
            &format!("Dropped {} dangling reference(s)", report.dangling_refs),
            "entry no longer existed",
        );
    }
    ui::outro_success(&ctx, "Cache repaired");
    Ok(())
}
