//! Rename command - move a document's references to its new path

use crate::cli::args::RenameArgs;
use crate::cli::commands::open_store;
use crate::config::Config;
use crate::document::retainer_path;
use crate::error::{ImgkeepError, ImgkeepResult};
use crate::ui::{self, UiContext};

/// Execute the rename command
pub async fn execute(args: RenameArgs, config: &Config) -> ImgkeepResult<()> {
    let ctx = UiContext::detect();
    let from = retainer_path(&args.from).await?;
    let to = retainer_path(&args.to).await?;

    let store = open_store(config).await?;
    let moved = store.rename_retainer(&from, &to).await?;
    store.close().await?;

    if !moved && from != to {
        return Err(ImgkeepError::RetainerNotFound(from));
    }

    ui::step_ok_detail(&ctx, "Renamed document", &format!("{} -> {}", from, to));
    Ok(())
}
