//! Terminal output
//!
//! `cliclack` framing and `indicatif` bars in a terminal, tagged plain
//! lines in CI or when stdout is piped.

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_success, outro_warn, remark, step_error_detail, step_info, step_ok,
    step_ok_detail, step_warn_hint,
};
pub use progress::{SyncProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, ImgkeepTheme};
