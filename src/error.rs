//! Error types for imgkeep
//!
//! Crate-level operations return `ImgkeepResult<T>`. Cache operations use the
//! narrower `CacheResult<T>` so a single failed download can be cloned out to
//! every placeholder waiting on it.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for imgkeep operations
pub type ImgkeepResult<T> = Result<T, ImgkeepError>;

/// Result type alias for cache store operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur in imgkeep
#[derive(Error, Debug)]
pub enum ImgkeepError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file already exists: {0}")]
    ConfigExists(PathBuf),

    // Cache errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Retainer not found: {0}")]
    RetainerNotFound(String),

    // Document errors
    #[error("Document not found: {0}")]
    DocumentNotFound(PathBuf),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ImgkeepError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cache(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigExists(_) => Some("Use --force to overwrite"),
            Self::Cache(CacheError::Fetch {
                is_internet_disconnected: true,
                ..
            }) => Some("Check your network connection and run the sync again"),
            Self::Cache(CacheError::Storage { .. }) => {
                Some("Run: imgkeep verify to repair the cache directory")
            }
            _ => None,
        }
    }
}

/// Closed tag for [`CacheError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheErrorKind {
    Validation,
    NotFound,
    Type,
    Fetch,
    Storage,
    Closed,
}

impl fmt::Display for CacheErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Type => "type",
            Self::Fetch => "fetch",
            Self::Storage => "storage",
            Self::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Errors produced by the cache store and download coordinator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Malformed or non-external request, rejected before any I/O
    #[error("Invalid cache request: {0}")]
    Validation(String),

    /// Expected miss
    #[error("Cache entry not found: {0}")]
    NotFound(String),

    /// Payload is not a supported image; never written to disk
    #[error("Unsupported content from {url}: {reason}")]
    Type { url: String, reason: String },

    /// Network or HTTP status failure
    #[error("Failed to fetch {url}: {reason}")]
    Fetch {
        url: String,
        status: Option<u16>,
        reason: String,
        is_retryable: bool,
        is_internet_disconnected: bool,
    },

    /// Read or write failure in the cache directory
    #[error("Cache storage error while {context}: {reason}")]
    Storage { context: String, reason: String },

    #[error("Cache store is closed")]
    Closed,
}

impl CacheError {
    /// Create a storage error from an IO failure
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            reason: source.to_string(),
        }
    }

    /// Create a non-retryable fetch error for an HTTP status
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Fetch {
            url: url.into(),
            status: Some(status),
            reason: format!("HTTP status {}", status),
            is_retryable: status >= 500 || status == 429,
            is_internet_disconnected: false,
        }
    }

    /// Tag of this error
    pub fn kind(&self) -> CacheErrorKind {
        match self {
            Self::Validation(_) => CacheErrorKind::Validation,
            Self::NotFound(_) => CacheErrorKind::NotFound,
            Self::Type { .. } => CacheErrorKind::Type,
            Self::Fetch { .. } => CacheErrorKind::Fetch,
            Self::Storage { .. } => CacheErrorKind::Storage,
            Self::Closed => CacheErrorKind::Closed,
        }
    }

    /// Whether a later pass may try the same resource again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { is_retryable, .. } => *is_retryable,
            Self::Storage { .. } => true,
            Self::Validation(_) | Self::NotFound(_) | Self::Type { .. } | Self::Closed => false,
        }
    }
}
