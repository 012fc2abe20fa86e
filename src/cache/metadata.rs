//! Persisted cache metadata
//!
//! `CacheRoot` is written as a single JSON document next to the blobs.

use crate::cache::key::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

/// What kind of resource an entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Undefined,
    Image,
}

/// File-level facts about a cached blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Locator the blob was downloaded from
    pub source_url: String,
    /// Last path segment of the locator
    pub name: String,
    /// Extension of the blob file on disk
    pub extension: Option<String>,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    /// SHA256 of the blob contents, hex-encoded
    pub content_hash: String,
}

/// Image facts read from the payload header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub downloaded_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub cache_control: Option<String>,
}

/// One metadata record per cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub kind: CacheKind,
    pub file: FileInfo,
    pub image: Option<ImageInfo>,
    pub time: TimeInfo,
}

impl CacheMetadata {
    /// Blob file name for this record
    pub fn blob_file_name(&self, key: &CacheKey) -> String {
        key.blob_file_name(self.file.extension.as_deref())
    }
}

/// The cache entries one document currently requires
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetainerRecord {
    pub refs: BTreeSet<CacheKey>,
}

/// Persisted root of the cache
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheRoot {
    pub retainers: BTreeMap<String, RetainerRecord>,
    pub items: BTreeMap<CacheKey, CacheMetadata>,
}

impl CacheRoot {
    /// Number of retainers referencing each key
    pub fn retain_counts(&self) -> HashMap<CacheKey, usize> {
        let mut counts = HashMap::new();
        for record in self.retainers.values() {
            for key in &record.refs {
                *counts.entry(key.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn retain_count(&self, key: &CacheKey) -> usize {
        self.retainers
            .values()
            .filter(|record| record.refs.contains(key))
            .count()
    }

    /// Items no retainer references
    pub fn unretained_keys(&self) -> Vec<CacheKey> {
        let counts = self.retain_counts();
        self.items
            .keys()
            .filter(|key| !counts.contains_key(*key))
            .cloned()
            .collect()
    }

    /// Drop refs to keys missing from `items` and delete emptied records.
    ///
    /// Returns the number of refs dropped.
    pub fn prune_dangling(&mut self) -> usize {
        let mut dropped = 0;
        let items = &self.items;
        for record in self.retainers.values_mut() {
            let before = record.refs.len();
            record.refs.retain(|key| items.contains_key(key));
            dropped += before - record.refs.len();
        }
        self.retainers.retain(|_, record| !record.refs.is_empty());
        dropped
    }
}

/// A cache entry handed back to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: CacheKey,
    pub metadata: CacheMetadata,
    /// Absolute path of the blob
    pub path: PathBuf,
}
