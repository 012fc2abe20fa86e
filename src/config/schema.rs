//! Configuration schema for imgkeep
//!
//! Configuration is stored at `~/.config/imgkeep/config.toml`

use crate::cache::key::DEFAULT_ALLOWED_SCHEMES;
use crate::cache::store::{DEFAULT_MAX_IMAGE_BYTES, DEFAULT_METADATA_FILE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding `cache.dir`
pub const CACHE_DIR_ENV: &str = "IMGKEEP_CACHE_DIR";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache directory and limits
    pub cache: CacheConfig,

    /// HTTP settings
    pub network: NetworkConfig,

    /// Reconciliation settings
    pub sync: SyncConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// General application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: LogFormat,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (default: platform cache dir + `imgkeep`)
    pub dir: Option<PathBuf>,

    /// Metadata file name inside the cache directory
    pub metadata_file: String,

    /// Largest accepted image payload
    pub max_image_bytes: u64,

    /// URL schemes treated as external
    pub allowed_schemes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            metadata_file: DEFAULT_METADATA_FILE.to_string(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            allowed_schemes: DEFAULT_ALLOWED_SCHEMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CacheConfig {
    /// Effective cache directory: env override, then config, then default
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        self.dir.clone().unwrap_or_else(default_cache_dir)
    }
}

/// Platform cache directory for imgkeep
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imgkeep")
}

/// HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,

    /// User-Agent header sent with every fetch
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("imgkeep/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// When a pass scans the whole document for locators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullScanPolicy {
    /// Every pass
    Always,
    /// On open and on structural edits
    #[default]
    Structural,
    /// Never; passes only add references
    Never,
}

/// Reconciliation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub full_scan: FullScanPolicy,
}
