//! Confirmation prompt with CI fallback

use super::context::UiContext;
use crate::error::{ImgkeepError, ImgkeepResult};

/// Ask a yes/no question; non-interactive runs get `default`
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> ImgkeepResult<bool> {
    if ctx.auto_yes() {
        return Ok(true);
    }
    if !ctx.is_interactive() {
        return Ok(default);
    }

    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| ImgkeepError::User(format!("Prompt task failed: {}", e)))?
    .map_err(|e| ImgkeepError::User(format!("Prompt failed: {}", e)))
}
