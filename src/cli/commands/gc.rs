//! Gc command - delete unreferenced images

use crate::cli::commands::open_store;
use crate::config::Config;
use crate::error::ImgkeepResult;
use crate::ui::{self, TaskSpinner, UiContext};

/// Execute the gc command
pub async fn execute(config: &Config) -> ImgkeepResult<()> {
    let ctx = UiContext::detect();
    let store = open_store(config).await?;

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Collecting unreferenced images...");
    let deleted = match store.collect_garbage().await {
        Ok(deleted) => deleted,
        Err(e) => {
            spinner.stop_error("Garbage collection failed");
            store.close().await?;
            return Err(e.into());
        }
    };
    store.close().await?;

    if deleted.is_empty() {
        spinner.stop("Nothing to collect");
    } else {
        spinner.stop(&format!("Deleted {} unreferenced image(s)", deleted.len()));
        for key in &deleted {
            ui::remark(&ctx, key.as_str());
        }
    }
    Ok(())
}
