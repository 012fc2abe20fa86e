//! Request identity and cache key derivation
//!
//! A cache key depends only on the normalized source locator, never on the
//! downloaded content. The key is the first 8 bytes of a SHA256 digest,
//! hex-encoded; collisions between distinct locators are accepted.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Schemes that count as externally resolvable by default
pub const DEFAULT_ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Longest file extension kept from a locator
const MAX_EXTENSION_LEN: usize = 8;

/// A request for one cached resource on behalf of one document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheRequest {
    /// Resource locator, e.g. an absolute URL
    pub source: String,
    /// Identity of the retaining document
    pub requester_path: String,
}

impl CacheRequest {
    pub fn new(source: impl Into<String>, requester_path: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            requester_path: requester_path.into(),
        }
    }

    /// Normalized locator; two requests share a cache entry iff these match
    pub fn normalized_source(&self) -> String {
        normalize_source(&self.source)
    }

    /// Cache key for this request
    pub fn key(&self) -> CacheKey {
        CacheKey::for_source(&self.source)
    }
}

/// Normalize a locator: trimmed, fragment dropped, scheme and host lowercased
///
/// Locators that do not parse as URLs are only trimmed.
pub fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

/// Reject empty and non-external requests
pub fn validate_request(req: &CacheRequest, allowed_schemes: &[String]) -> CacheResult<()> {
    let source = req.source.trim();
    if source.is_empty() {
        return Err(CacheError::Validation("empty source".to_string()));
    }
    if req.requester_path.trim().is_empty() {
        return Err(CacheError::Validation(format!(
            "empty requester path for {}",
            source
        )));
    }

    let url = Url::parse(source)
        .map_err(|e| CacheError::Validation(format!("'{}' is not a URL: {}", source, e)))?;

    if !allowed_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(url.scheme()))
    {
        return Err(CacheError::Validation(format!(
            "'{}' is not an external resource (scheme '{}')",
            source,
            url.scheme()
        )));
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(CacheError::Validation(format!("'{}' has no host", source)));
    }

    Ok(())
}

/// Stable identity of a cache entry, addressing both metadata and blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a raw (un-normalized) locator
    pub fn for_source(source: &str) -> Self {
        let normalized = normalize_source(source);
        let digest = Sha256::digest(normalized.as_bytes());
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blob file name: `<key>.<ext>`, or `<key>` without an extension
    pub fn blob_file_name(&self, extension: Option<&str>) -> String {
        match extension {
            Some(ext) if !ext.is_empty() => format!("{}.{}", self.0, ext),
            _ => self.0.clone(),
        }
    }

    /// Parse the key back out of a blob file name
    pub fn from_blob_file_name(name: &str) -> Option<Self> {
        let stem = name.split('.').next()?;
        let valid = stem.len() == 16 && stem.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(stem.to_ascii_lowercase()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File name and extension taken from a locator's last path segment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlobName {
    pub file_name: String,
    pub extension: Option<String>,
}

impl BlobName {
    pub fn for_source(source: &str) -> Self {
        let segment = Url::parse(source.trim())
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segs| segs.next_back().map(str::to_string))
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_default();

        let extension = segment
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_EXTENSION_LEN
                    && ext.bytes().all(|b| b.is_ascii_alphanumeric())
            });

        Self {
            file_name: segment,
            extension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemes() -> Vec<String> {
        DEFAULT_ALLOWED_SCHEMES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_is_deterministic() {
        let a = CacheKey::for_source("https://img.test/cat.png");
        let b = CacheKey::for_source("https://img.test/cat.png");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn key_ignores_fragment_and_host_case() {
        let a = CacheKey::for_source("https://IMG.test/cat.png#frag");
        let b = CacheKey::for_source("  https://img.test/cat.png ");
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_per_source() {
        let a = CacheKey::for_source("https://img.test/cat.png");
        let b = CacheKey::for_source("https://img.test/dog.png");
        assert_ne!(a, b);
    }

    #[test]
    fn blob_file_name_roundtrip() {
        let key = CacheKey::for_source("https://img.test/cat.png");
        let name = key.blob_file_name(Some("png"));
        assert!(name.ends_with(".png"));
        assert_eq!(CacheKey::from_blob_file_name(&name), Some(key.clone()));
        assert_eq!(key.blob_file_name(None), key.as_str());
        assert_eq!(CacheKey::from_blob_file_name("cache.json"), None);
        assert_eq!(CacheKey::from_blob_file_name(".gitignore"), None);
    }

    #[test]
    fn validate_rejects_empty_source() {
        let req = CacheRequest::new("   ", "notes/a.md");
        assert!(matches!(
            validate_request(&req, &schemes()),
            Err(CacheError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_local_sources() {
        for source in ["file:///etc/passwd", "attachments/cat.png", "data:image/png;base64,AAAA"] {
            let req = CacheRequest::new(source, "notes/a.md");
            assert!(
                validate_request(&req, &schemes()).is_err(),
                "{} should be rejected",
                source
            );
        }
    }

    #[test]
    fn validate_accepts_http() {
        let req = CacheRequest::new("https://img.test/cat.png", "notes/a.md");
        assert!(validate_request(&req, &schemes()).is_ok());
    }

    #[test]
    fn validate_rejects_empty_requester() {
        let req = CacheRequest::new("https://img.test/cat.png", "");
        assert!(validate_request(&req, &schemes()).is_err());
    }

    #[test]
    fn blob_name_from_url() {
        let name = BlobName::for_source("https://img.test/a/b/Cat.PNG?size=2");
        assert_eq!(name.file_name, "Cat.PNG");
        assert_eq!(name.extension.as_deref(), Some("png"));

        let bare = BlobName::for_source("https://img.test/render");
        assert_eq!(bare.extension, None);

        let root = BlobName::for_source("https://img.test/");
        assert_eq!(root.file_name, "");
    }
}
