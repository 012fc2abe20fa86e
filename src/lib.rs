//! imgkeep - offline cache for images referenced by Markdown documents
//!
//! Documents retain the remote images they reference; an image is deleted
//! once no document retains it.

pub mod cache;
pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod sync;
pub mod ui;

pub use error::{ImgkeepError, ImgkeepResult};
