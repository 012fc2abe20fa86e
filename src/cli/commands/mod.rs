//! CLI command implementations

pub mod clear;
pub mod config;
pub mod forget;
pub mod gc;
pub mod list;
pub mod rename;
pub mod sync;
pub mod verify;

pub use clear::execute as clear;
pub use config::execute as config;
pub use forget::execute as forget;
pub use gc::execute as gc;
pub use list::execute as list;
pub use rename::execute as rename;
pub use sync::execute as sync;
pub use verify::execute as verify;

use crate::cache::{CacheStore, FsStorage, HttpFetcher, HttpOptions, StoreOptions};
use crate::config::Config;
use crate::error::ImgkeepResult;
use std::sync::Arc;
use std::time::Duration;

/// Open the on-disk cache described by `config`
pub(crate) async fn open_store(config: &Config) -> ImgkeepResult<Arc<CacheStore>> {
    let options = StoreOptions::from_config(config);
    let fetcher = HttpFetcher::new(HttpOptions {
        timeout: Duration::from_secs(config.network.timeout_secs),
        user_agent: config.network.user_agent.clone(),
        max_body_bytes: options.max_image_bytes,
    });
    let store = CacheStore::create(options, Arc::new(FsStorage::new()), Arc::new(fetcher)).await?;
    Ok(Arc::new(store))
}

/// Human-readable byte count
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
