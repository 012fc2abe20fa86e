//! Forget command - release a document's references

use crate::cli::args::ForgetArgs;
use crate::cli::commands::open_store;
use crate::config::Config;
use crate::document::retainer_path;
use crate::error::{ImgkeepError, ImgkeepResult};
use crate::ui::{self, UiContext};

/// Execute the forget command
pub async fn execute(args: ForgetArgs, config: &Config) -> ImgkeepResult<()> {
    let ctx = UiContext::detect();
    let retainer = retainer_path(&args.document).await?;

    let store = open_store(config).await?;
    if !store.snapshot().await.retainers.contains_key(&retainer) {
        store.close().await?;
        return Err(ImgkeepError::RetainerNotFound(retainer));
    }

    let outcome = store.remove_retainer(&retainer).await?;
    store.close().await?;

    ui::step_ok_detail(
        &ctx,
        &format!("Released {} image(s)", outcome.removed.len()),
        &retainer,
    );
    if !outcome.deleted.is_empty() {
        ui::remark(
            &ctx,
            &format!("{} image(s) no longer referenced were deleted", outcome.deleted.len()),
        );
    }
    Ok(())
}
