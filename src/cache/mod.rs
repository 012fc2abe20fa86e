//! Retain-counted image cache
//!
//! Remote images referenced by documents are downloaded once per cache key
//! and stored as blobs next to a single JSON metadata file. Each document
//! (a *retainer*) holds references to the keys it currently uses; an entry
//! is deleted when the last reference goes away.
//!
//! # On-disk layout
//!
//! | File | Contents |
//! |------|----------|
//! | `cache.json` | retainers and item metadata |
//! | `<key>.<ext>` | downloaded image bytes |
//! | `.gitignore` | never touched |
//!
//! # Invariants
//!
//! - Every item's blob exists (repaired by [`CacheStore::verify`])
//! - Every retainer reference names an existing item
//! - At most one download runs per key

pub(crate) mod download;
pub mod fetch;
pub mod key;
pub mod metadata;
pub mod probe;
pub mod storage;
pub mod store;

pub use fetch::{FetchResponse, Fetcher, HttpFetcher, HttpOptions, ScriptedFetcher};
pub use key::{BlobName, CacheKey, CacheRequest};
pub use metadata::{CacheItem, CacheKind, CacheMetadata, CacheRoot, RetainerRecord};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use store::{
    CacheStats, CacheStore, Lookup, RetainOptions, RetainOutcome, StoreOptions, VerifyReport,
};
