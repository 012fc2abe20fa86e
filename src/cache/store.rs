//! Retain-counted cache store
//!
//! Owns the in-memory [`CacheRoot`], the download coordinator, and the
//! metadata file. Every mutation goes through one async mutex; the
//! reconciler additionally serializes whole passes.

use crate::cache::download::DownloadCoordinator;
use crate::cache::fetch::Fetcher;
use crate::cache::key::{self, BlobName, CacheKey, CacheRequest, DEFAULT_ALLOWED_SCHEMES};
use crate::cache::metadata::{CacheItem, CacheRoot};
use crate::cache::storage::{Storage, TEMP_FILE_PREFIX};
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default metadata file name inside the cache directory
pub const DEFAULT_METADATA_FILE: &str = "cache.json";

/// Marker file never touched by clearing or verification
pub const GITIGNORE_FILE: &str = ".gitignore";

/// Default largest accepted payload (20 MiB)
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Settings for a [`CacheStore`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dir: PathBuf,
    pub metadata_file: String,
    pub allowed_schemes: Vec<String>,
    pub max_image_bytes: u64,
}

impl StoreOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            metadata_file: DEFAULT_METADATA_FILE.to_string(),
            allowed_schemes: DEFAULT_ALLOWED_SCHEMES.iter().map(|s| s.to_string()).collect(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.cache.resolved_dir(),
            metadata_file: config.cache.metadata_file.clone(),
            allowed_schemes: config.cache.allowed_schemes.clone(),
            max_image_bytes: config.cache.max_image_bytes,
        }
    }
}

/// Where metadata and blobs live
#[derive(Debug, Clone)]
pub struct CacheLayout {
    dir: PathBuf,
    metadata_file: String,
}

impl CacheLayout {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(&self.metadata_file)
    }

    pub fn blob_path(&self, key: &CacheKey, extension: Option<&str>) -> PathBuf {
        self.dir.join(key.blob_file_name(extension))
    }

    /// Files excluded from clearing and orphan sweeps
    pub fn is_reserved(&self, file_name: &str) -> bool {
        file_name == self.metadata_file || file_name == GITIGNORE_FILE
    }
}

pub(crate) struct StoreState {
    pub(crate) root: CacheRoot,
    pub(crate) dirty: bool,
    /// Metadata file mtime as of our last load or save
    loaded_mtime: Option<SystemTime>,
    /// Bumped by `clear_all`; downloads started earlier must not commit
    pub(crate) generation: u64,
}

/// State shared between the store and its download coordinator
pub(crate) struct StoreShared {
    pub(crate) layout: CacheLayout,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) state: Mutex<StoreState>,
}

impl StoreShared {
    /// Write the whole root; clears the dirty flag only on success
    pub(crate) async fn persist_locked(&self, state: &mut StoreState) -> CacheResult<()> {
        let path = self.layout.metadata_path();
        let content = serde_json::to_string_pretty(&state.root).map_err(|e| CacheError::Storage {
            context: "serializing cache metadata".to_string(),
            reason: e.to_string(),
        })?;

        self.storage
            .write(&path, &content)
            .await
            .map_err(|e| CacheError::storage(format!("writing {}", path.display()), e))?;

        state.loaded_mtime = self
            .storage
            .stat(&path)
            .await
            .map_err(|e| CacheError::storage(format!("reading mtime of {}", path.display()), e))?;
        state.dirty = false;
        debug!(items = state.root.items.len(), "saved cache metadata");
        Ok(())
    }

    /// Delete an item's blob, then its metadata. Keeps the item if the blob
    /// cannot be removed so a blob never outlives its record.
    async fn delete_item_locked(&self, state: &mut StoreState, key: &CacheKey) -> bool {
        let Some(meta) = state.root.items.get(key) else {
            return false;
        };
        let path = self.layout.dir.join(meta.blob_file_name(key));
        match self.storage.remove(&path).await {
            Ok(()) => {
                state.root.items.remove(key);
                state.dirty = true;
                debug!(%key, "deleted cache entry");
                true
            }
            Err(e) => {
                warn!(%key, "Failed to delete blob {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// Result of [`CacheStore::lookup`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Lookup {
    pub found: bool,
    pub item: Option<CacheItem>,
    /// `None` when the file check was skipped
    pub file_confirmed_present: Option<bool>,
}

impl Lookup {
    /// Found, and the blob was not shown to be missing
    pub fn is_usable(&self) -> bool {
        self.found && self.file_confirmed_present != Some(false)
    }
}

/// Caller-supplied knobs for [`CacheStore::update_retained_caches`]
#[derive(Debug, Clone, Default)]
pub struct RetainOptions {
    /// Requests that must not be released even if absent from this call
    pub requests_to_ignore: Vec<CacheRequest>,
    /// Only add references, never release
    pub prevent_releases: bool,
}

/// What a retain update changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetainOutcome {
    pub added: Vec<CacheKey>,
    pub removed: Vec<CacheKey>,
    /// Removed keys whose global retain count reached zero
    pub deleted: Vec<CacheKey>,
}

impl RetainOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Result of [`CacheStore::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Items dropped because their blob was missing
    pub missing_blobs: Vec<CacheKey>,
    /// Files deleted because no item names them
    pub orphan_files: Vec<String>,
    pub dangling_refs: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing_blobs.is_empty() && self.orphan_files.is_empty() && self.dangling_refs == 0
    }
}

/// Summary counters for display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub retainers: usize,
    pub total_bytes: u64,
    pub unretained: usize,
    pub in_flight: usize,
}

/// The cache store
pub struct CacheStore {
    shared: Arc<StoreShared>,
    downloads: DownloadCoordinator,
    options: StoreOptions,
    closed: AtomicBool,
}

impl CacheStore {
    /// Open the store, loading existing metadata if present
    pub async fn create(
        options: StoreOptions,
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> CacheResult<Self> {
        let layout = CacheLayout {
            dir: options.dir.clone(),
            metadata_file: options.metadata_file.clone(),
        };

        storage
            .create_dir_all(&layout.dir)
            .await
            .map_err(|e| CacheError::storage(format!("creating {}", layout.dir.display()), e))?;

        let mut state = StoreState {
            root: CacheRoot::default(),
            dirty: false,
            loaded_mtime: None,
            generation: 0,
        };
        if let Some((root, mtime)) = read_root(storage.as_ref(), &layout.metadata_path()).await? {
            state.root = root;
            state.loaded_mtime = Some(mtime);
        }
        let dropped = state.root.prune_dangling();
        if dropped > 0 {
            warn!(dropped, "Dropped dangling cache references on load");
            state.dirty = true;
        }

        info!(
            dir = %layout.dir.display(),
            items = state.root.items.len(),
            retainers = state.root.retainers.len(),
            "opened image cache"
        );

        let shared = Arc::new(StoreShared {
            layout,
            storage,
            state: Mutex::new(state),
        });
        let downloads = DownloadCoordinator::new(Arc::clone(&shared), fetcher, options.max_image_bytes);

        Ok(Self {
            shared,
            downloads,
            options,
            closed: AtomicBool::new(false),
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.shared.layout
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Reject empty or non-externally-resolvable requests
    pub fn validate_request(&self, req: &CacheRequest) -> CacheResult<()> {
        key::validate_request(req, &self.options.allowed_schemes)
    }

    /// Look up metadata; confirms the blob on disk unless
    /// `allow_missing_file_check` is set. Never mutates state.
    pub async fn lookup(
        &self,
        req: &CacheRequest,
        allow_missing_file_check: bool,
    ) -> CacheResult<Lookup> {
        self.ensure_open()?;
        self.validate_request(req)?;

        let key = req.key();
        let metadata = {
            let state = self.shared.state.lock().await;
            state.root.items.get(&key).cloned()
        };
        let Some(metadata) = metadata else {
            return Ok(Lookup::default());
        };

        let path = self.shared.layout.dir.join(metadata.blob_file_name(&key));
        let file_confirmed_present = if allow_missing_file_check {
            None
        } else {
            let present = self
                .shared
                .storage
                .exists(&path)
                .await
                .map_err(|e| CacheError::storage(format!("checking {}", path.display()), e))?;
            if !present {
                debug!(%key, "metadata present but blob missing");
            }
            Some(present)
        };

        Ok(Lookup {
            found: true,
            item: Some(CacheItem {
                key,
                metadata,
                path,
            }),
            file_confirmed_present,
        })
    }

    /// Serve from cache, or download on miss (always download when `force`)
    pub async fn fetch_or_download(&self, req: &CacheRequest, force: bool) -> CacheResult<CacheItem> {
        self.ensure_open()?;
        self.validate_request(req)?;

        if !force {
            let lookup = self.lookup(req, false).await?;
            if lookup.is_usable() {
                if let Some(item) = lookup.item {
                    return Ok(item);
                }
            }
        }

        self.downloads
            .download(req, BlobName::for_source(&req.source))
            .await
    }

    /// Record an access to an entry
    pub async fn touch(&self, key: &CacheKey) -> CacheResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock().await;
        if let Some(meta) = state.root.items.get_mut(key) {
            meta.time.last_access_at = Utc::now();
            state.dirty = true;
        }
        Ok(())
    }

    /// Replace `retainer_path`'s references with `requests` and delete
    /// entries no retainer references any more.
    ///
    /// Calling this twice with the same requests is a no-op the second time.
    /// The caller persists with [`CacheStore::save_if_dirty`].
    pub async fn update_retained_caches(
        &self,
        requests: &[CacheRequest],
        retainer_path: &str,
        options: &RetainOptions,
    ) -> CacheResult<RetainOutcome> {
        self.ensure_open()?;
        self.check_external_change().await?;

        let mut state = self.shared.state.lock().await;

        let mut desired = BTreeSet::new();
        for req in requests {
            if let Err(e) = self.validate_request(req) {
                debug!(retainer = retainer_path, "skipping retain request: {}", e);
                continue;
            }
            let key = req.key();
            if !state.root.items.contains_key(&key) {
                debug!(retainer = retainer_path, %key, "dropping reference to missing entry");
                continue;
            }
            desired.insert(key);
        }

        let ignored: BTreeSet<CacheKey> = options
            .requests_to_ignore
            .iter()
            .map(CacheRequest::key)
            .collect();

        let old = state
            .root
            .retainers
            .get(retainer_path)
            .map(|record| record.refs.clone())
            .unwrap_or_default();

        let added: BTreeSet<CacheKey> = desired.difference(&old).cloned().collect();
        let removed: BTreeSet<CacheKey> = if options.prevent_releases {
            BTreeSet::new()
        } else {
            old.difference(&desired)
                .filter(|key| !ignored.contains(*key))
                .cloned()
                .collect()
        };

        if added.is_empty() && removed.is_empty() {
            return Ok(RetainOutcome::default());
        }

        let refs: BTreeSet<CacheKey> = old
            .union(&added)
            .filter(|key| !removed.contains(*key))
            .cloned()
            .collect();
        if refs.is_empty() {
            state.root.retainers.remove(retainer_path);
        } else {
            state
                .root
                .retainers
                .entry(retainer_path.to_string())
                .or_default()
                .refs = refs;
        }
        state.dirty = true;

        let counts = state.root.retain_counts();
        let mut deleted = Vec::new();
        for key in &removed {
            if counts.contains_key(key) {
                continue;
            }
            if self.shared.delete_item_locked(&mut state, key).await {
                deleted.push(key.clone());
            }
        }

        debug!(
            retainer = retainer_path,
            added = added.len(),
            removed = removed.len(),
            deleted = deleted.len(),
            "updated retained caches"
        );

        Ok(RetainOutcome {
            added: added.into_iter().collect(),
            removed: removed.into_iter().collect(),
            deleted,
        })
    }

    /// Release every reference held by a deleted document
    pub async fn remove_retainer(&self, retainer_path: &str) -> CacheResult<RetainOutcome> {
        self.update_retained_caches(&[], retainer_path, &RetainOptions::default())
            .await
    }

    /// Move a renamed document's references to its new path
    pub async fn rename_retainer(&self, old_path: &str, new_path: &str) -> CacheResult<bool> {
        self.ensure_open()?;
        if old_path == new_path {
            return Ok(false);
        }
        self.check_external_change().await?;

        let mut state = self.shared.state.lock().await;
        let Some(record) = state.root.retainers.remove(old_path) else {
            return Ok(false);
        };
        state
            .root
            .retainers
            .entry(new_path.to_string())
            .or_default()
            .refs
            .extend(record.refs);
        state.dirty = true;
        info!(from = old_path, to = new_path, "renamed retainer");
        Ok(true)
    }

    /// Delete every entry no retainer references
    pub async fn collect_garbage(&self) -> CacheResult<Vec<CacheKey>> {
        self.ensure_open()?;
        self.check_external_change().await?;

        let in_flight = self.downloads.in_flight_keys();
        let mut state = self.shared.state.lock().await;
        let mut deleted = Vec::new();
        for key in state.root.unretained_keys() {
            if in_flight.contains(&key) {
                continue;
            }
            if self.shared.delete_item_locked(&mut state, &key).await {
                deleted.push(key);
            }
        }
        if !deleted.is_empty() {
            info!(deleted = deleted.len(), "collected unretained entries");
        }
        Ok(deleted)
    }

    /// Repair the blob/item invariant and drop dangling references
    pub async fn verify(&self) -> CacheResult<VerifyReport> {
        self.ensure_open()?;
        self.check_external_change().await?;

        let in_flight = self.downloads.in_flight_keys();
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let mut report = VerifyReport::default();

        let items: Vec<(CacheKey, String)> = state
            .root
            .items
            .iter()
            .map(|(key, meta)| (key.clone(), meta.blob_file_name(key)))
            .collect();
        for (key, file_name) in &items {
            let path = shared.layout.dir.join(file_name);
            let present = shared
                .storage
                .exists(&path)
                .await
                .map_err(|e| CacheError::storage(format!("checking {}", path.display()), e))?;
            if !present {
                warn!(%key, "Blob missing, dropping entry");
                state.root.items.remove(key);
                report.missing_blobs.push(key.clone());
            }
        }

        let files = shared
            .storage
            .list(&shared.layout.dir)
            .await
            .map_err(|e| CacheError::storage(format!("listing {}", shared.layout.dir.display()), e))?;
        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if shared.layout.is_reserved(name) {
                continue;
            }
            let owner = CacheKey::from_blob_file_name(name);
            if owner.as_ref().is_some_and(|key| in_flight.contains(key)) {
                continue;
            }
            let owned = !name.starts_with(TEMP_FILE_PREFIX)
                && owner.is_some_and(|key| {
                    state
                        .root
                        .items
                        .get(&key)
                        .is_some_and(|meta| meta.blob_file_name(&key) == name)
                });
            if owned {
                continue;
            }
            match shared.storage.remove(&path).await {
                Ok(()) => report.orphan_files.push(name.to_string()),
                Err(e) => warn!("Failed to remove orphan {}: {}", path.display(), e),
            }
        }

        report.dangling_refs = state.root.prune_dangling();
        if !report.missing_blobs.is_empty() || report.dangling_refs > 0 {
            state.dirty = true;
        }
        info!(
            missing = report.missing_blobs.len(),
            orphans = report.orphan_files.len(),
            dangling = report.dangling_refs,
            "verified cache"
        );
        Ok(report)
    }

    /// Cancel downloads, delete all blobs, and reset the root.
    ///
    /// Returns the number of files removed.
    pub async fn clear_all(&self) -> CacheResult<usize> {
        self.ensure_open()?;
        let cancelled = self.downloads.cancel_all();

        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        state.generation += 1;

        let files = shared
            .storage
            .list(&shared.layout.dir)
            .await
            .map_err(|e| CacheError::storage(format!("listing {}", shared.layout.dir.display()), e))?;

        let mut removed = 0;
        for path in files {
            let reserved = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| shared.layout.is_reserved(name));
            if reserved {
                continue;
            }
            match shared.storage.remove(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        state.root = CacheRoot::default();
        state.dirty = true;
        shared.persist_locked(&mut state).await?;

        info!(removed, cancelled, "cleared image cache");
        Ok(removed)
    }

    /// Persist the root if anything changed since the last save
    pub async fn save_if_dirty(&self) -> CacheResult<bool> {
        let mut state = self.shared.state.lock().await;
        if !state.dirty {
            return Ok(false);
        }
        match self.shared.persist_locked(&mut state).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Failed to save cache metadata, will retry: {}", e);
                Err(e)
            }
        }
    }

    /// Reload the metadata file if another instance rewrote it.
    ///
    /// Returns whether a reload happened.
    pub async fn check_external_change(&self) -> CacheResult<bool> {
        let path = self.shared.layout.metadata_path();
        let mut state = self.shared.state.lock().await;

        let mtime = self
            .shared
            .storage
            .stat(&path)
            .await
            .map_err(|e| CacheError::storage(format!("reading mtime of {}", path.display()), e))?;

        let advanced = match (mtime, state.loaded_mtime) {
            (Some(current), Some(loaded)) => current > loaded,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !advanced {
            return Ok(false);
        }

        match read_root(self.shared.storage.as_ref(), &path).await? {
            Some((mut root, mtime)) => {
                if state.dirty {
                    warn!("Metadata changed on disk; discarding unsaved in-memory changes");
                }
                let dropped = root.prune_dangling();
                state.root = root;
                state.loaded_mtime = Some(mtime);
                state.dirty = dropped > 0;
                info!(items = state.root.items.len(), "reloaded cache metadata");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel downloads, flush metadata, and refuse further calls
    pub async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.downloads.cancel_all();
        self.save_if_dirty().await?;
        debug!("closed image cache");
        Ok(())
    }

    /// Point-in-time copy of the root
    pub async fn snapshot(&self) -> CacheRoot {
        self.shared.state.lock().await.root.clone()
    }

    pub async fn retain_count(&self, key: &CacheKey) -> usize {
        self.shared.state.lock().await.root.retain_count(key)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock().await;
        CacheStats {
            items: state.root.items.len(),
            retainers: state.root.retainers.len(),
            total_bytes: state.root.items.values().map(|m| m.file.size_bytes).sum(),
            unretained: state.root.unretained_keys().len(),
            in_flight: self.downloads.in_flight_count(),
        }
    }

    /// Whether unsaved changes exist
    pub async fn is_dirty(&self) -> bool {
        self.shared.state.lock().await.dirty
    }
}

/// Read and parse the metadata file. A corrupted file yields an empty root.
async fn read_root(storage: &dyn Storage, path: &Path) -> CacheResult<Option<(CacheRoot, SystemTime)>> {
    let Some(mtime) = storage
        .stat(path)
        .await
        .map_err(|e| CacheError::storage(format!("reading mtime of {}", path.display()), e))?
    else {
        return Ok(None);
    };

    let content = storage
        .read(path)
        .await
        .map_err(|e| CacheError::storage(format!("reading {}", path.display()), e))?;

    let root = match serde_json::from_str::<CacheRoot>(&content) {
        Ok(root) => root,
        Err(e) => {
            warn!("Corrupted cache metadata {}, starting empty: {}", path.display(), e);
            CacheRoot::default()
        }
    };
    Ok(Some((root, mtime)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetch::FetchResponse;
    use crate::cache::probe::fixtures::PNG_1X1;
    use crate::cache::storage::MemoryStorage;
    use crate::cache::fetch::ScriptedFetcher;

    const DIR: &str = "/cache";

    async fn open(storage: &Arc<MemoryStorage>, fetcher: &Arc<ScriptedFetcher>) -> CacheStore {
        CacheStore::create(
            StoreOptions::new(DIR),
            Arc::clone(storage) as Arc<dyn Storage>,
            Arc::clone(fetcher) as Arc<dyn Fetcher>,
        )
        .await
        .unwrap()
    }

    fn png(fetcher: &ScriptedFetcher, url: &str) {
        fetcher.respond(url, FetchResponse {
            status: 200,
            headers: vec![("content-type".into(), "image/png".into())],
            body: PNG_1X1.to_vec(),
        });
    }

    fn req(url: &str, doc: &str) -> CacheRequest {
        CacheRequest::new(url, doc)
    }

    fn metadata_path() -> PathBuf {
        PathBuf::from(DIR).join(DEFAULT_METADATA_FILE)
    }

    #[tokio::test]
    async fn lookup_miss_then_hit() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;

        let r = req("https://img.test/a.png", "a.md");
        assert!(!store.lookup(&r, false).await.unwrap().found);

        let item = store.fetch_or_download(&r, false).await.unwrap();
        assert!(storage.contains(&item.path));

        let hit = store.lookup(&r, false).await.unwrap();
        assert!(hit.is_usable());
        assert_eq!(hit.file_confirmed_present, Some(true));
        assert_eq!(hit.item.unwrap().key, item.key);

        let unchecked = store.lookup(&r, true).await.unwrap();
        assert_eq!(unchecked.file_confirmed_present, None);
    }

    #[tokio::test]
    async fn fetch_or_download_uses_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;
        let r = req("https://img.test/a.png", "a.md");

        store.fetch_or_download(&r, false).await.unwrap();
        store.fetch_or_download(&r, false).await.unwrap();
        assert_eq!(fetcher.calls("https://img.test/a.png"), 1);

        store.fetch_or_download(&r, true).await.unwrap();
        assert_eq!(fetcher.calls("https://img.test/a.png"), 2);
    }

    #[tokio::test]
    async fn invalid_requests_touch_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let store = open(&storage, &fetcher).await;

        for source in ["", "file:///tmp/a.png"] {
            let r = req(source, "a.md");
            assert!(store.validate_request(&r).is_err());
            assert!(matches!(
                store.fetch_or_download(&r, false).await,
                Err(CacheError::Validation(_))
            ));
        }
        assert_eq!(fetcher.total_calls(), 0);
        assert!(!store.is_dirty().await);
        assert!(storage.file_names().is_empty());
    }

    #[tokio::test]
    async fn shared_entry_released_by_last_retainer() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/k1.png");
        let store = open(&storage, &fetcher).await;

        let url = "https://img.test/k1.png";
        let item = store.fetch_or_download(&req(url, "a.md"), false).await.unwrap();
        let opts = RetainOptions::default();

        store.update_retained_caches(&[req(url, "a.md")], "a.md", &opts).await.unwrap();
        store.update_retained_caches(&[req(url, "b.md")], "b.md", &opts).await.unwrap();
        assert_eq!(store.retain_count(&item.key).await, 2);

        let outcome = store.update_retained_caches(&[], "a.md", &opts).await.unwrap();
        assert!(outcome.deleted.is_empty());
        assert_eq!(store.retain_count(&item.key).await, 1);
        assert!(storage.contains(&item.path));

        let outcome = store.update_retained_caches(&[], "b.md", &opts).await.unwrap();
        assert_eq!(outcome.deleted, vec![item.key.clone()]);
        assert!(!storage.contains(&item.path));

        let root = store.snapshot().await;
        assert!(root.items.is_empty());
        assert!(root.retainers.is_empty());
    }

    #[tokio::test]
    async fn retain_update_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;
        let r = req("https://img.test/a.png", "a.md");
        store.fetch_or_download(&r, false).await.unwrap();
        let writes_before = storage.write_count(&metadata_path());

        let first = store
            .update_retained_caches(&[r.clone(), r.clone()], "a.md", &RetainOptions::default())
            .await
            .unwrap();
        assert!(first.changed());
        assert!(store.save_if_dirty().await.unwrap());

        let second = store
            .update_retained_caches(&[r.clone()], "a.md", &RetainOptions::default())
            .await
            .unwrap();
        assert!(!second.changed());
        assert!(!store.save_if_dirty().await.unwrap());

        assert_eq!(storage.write_count(&metadata_path()), writes_before + 1);
        let root = store.snapshot().await;
        assert_eq!(root.retainers["a.md"].refs.len(), 1);
    }

    #[tokio::test]
    async fn ignored_and_prevented_releases_keep_refs() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        png(&fetcher, "https://img.test/b.png");
        let store = open(&storage, &fetcher).await;
        let a = req("https://img.test/a.png", "doc.md");
        let b = req("https://img.test/b.png", "doc.md");
        store.fetch_or_download(&a, false).await.unwrap();
        store.fetch_or_download(&b, false).await.unwrap();

        store
            .update_retained_caches(&[a.clone(), b.clone()], "doc.md", &RetainOptions::default())
            .await
            .unwrap();

        let ignore_b = RetainOptions {
            requests_to_ignore: vec![b.clone()],
            prevent_releases: false,
        };
        let outcome = store
            .update_retained_caches(&[a.clone()], "doc.md", &ignore_b)
            .await
            .unwrap();
        assert!(!outcome.changed());
        assert_eq!(store.retain_count(&b.key()).await, 1);

        let prevent = RetainOptions {
            requests_to_ignore: vec![],
            prevent_releases: true,
        };
        let outcome = store.update_retained_caches(&[], "doc.md", &prevent).await.unwrap();
        assert!(!outcome.changed());
        assert_eq!(store.snapshot().await.items.len(), 2);
    }

    #[tokio::test]
    async fn refs_to_missing_items_are_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let store = open(&storage, &fetcher).await;

        let outcome = store
            .update_retained_caches(
                &[req("https://img.test/never.png", "a.md")],
                "a.md",
                &RetainOptions::default(),
            )
            .await
            .unwrap();
        assert!(!outcome.changed());
        assert!(store.snapshot().await.retainers.is_empty());
    }

    #[tokio::test]
    async fn rename_and_remove_retainer() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;
        let r = req("https://img.test/a.png", "old.md");
        let item = store.fetch_or_download(&r, false).await.unwrap();
        store
            .update_retained_caches(&[r], "old.md", &RetainOptions::default())
            .await
            .unwrap();

        assert!(store.rename_retainer("old.md", "new.md").await.unwrap());
        assert!(!store.rename_retainer("old.md", "new.md").await.unwrap());
        let root = store.snapshot().await;
        assert!(root.retainers.contains_key("new.md"));
        assert!(!root.retainers.contains_key("old.md"));

        let outcome = store.remove_retainer("new.md").await.unwrap();
        assert_eq!(outcome.deleted, vec![item.key]);
        assert!(!storage.contains(&item.path));
    }

    #[tokio::test]
    async fn save_failure_keeps_dirty_flag() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;
        let r = req("https://img.test/a.png", "a.md");
        let item = store.fetch_or_download(&r, false).await.unwrap();

        store.touch(&item.key).await.unwrap();
        storage.fail_writes_to(DEFAULT_METADATA_FILE);
        assert!(store.save_if_dirty().await.is_err());
        assert!(store.is_dirty().await);

        storage.clear_failures();
        assert!(store.save_if_dirty().await.unwrap());
        assert!(!store.is_dirty().await);
    }

    #[tokio::test]
    async fn external_change_is_reloaded() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;
        store
            .fetch_or_download(&req("https://img.test/a.png", "a.md"), false)
            .await
            .unwrap();
        assert!(!store.check_external_change().await.unwrap());

        storage.put(&metadata_path(), b"{\"retainers\":{},\"items\":{}}");
        assert!(store.check_external_change().await.unwrap());
        assert!(store.snapshot().await.items.is_empty());
    }

    #[tokio::test]
    async fn reopen_restores_root() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let r = req("https://img.test/a.png", "a.md");

        let store = open(&storage, &fetcher).await;
        store.fetch_or_download(&r, false).await.unwrap();
        store
            .update_retained_caches(&[r.clone()], "a.md", &RetainOptions::default())
            .await
            .unwrap();
        store.close().await.unwrap();
        let before = store.snapshot().await;

        let reopened = open(&storage, &fetcher).await;
        assert_eq!(reopened.snapshot().await, before);
    }

    #[tokio::test]
    async fn corrupted_metadata_starts_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put(&metadata_path(), b"{not json");
        let fetcher = Arc::new(ScriptedFetcher::new());

        let store = open(&storage, &fetcher).await;
        assert!(store.snapshot().await.items.is_empty());
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let store = open(&storage, &fetcher).await;
        store.close().await.unwrap();

        let r = req("https://img.test/a.png", "a.md");
        assert_eq!(store.lookup(&r, false).await, Err(CacheError::Closed));
    }

    #[tokio::test]
    async fn clear_all_keeps_reserved_files() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        let store = open(&storage, &fetcher).await;
        storage.put(&PathBuf::from(DIR).join(GITIGNORE_FILE), b"*\n");
        store
            .fetch_or_download(&req("https://img.test/a.png", "a.md"), false)
            .await
            .unwrap();

        assert_eq!(store.clear_all().await.unwrap(), 1);
        let mut names = storage.file_names();
        names.sort();
        assert_eq!(names, vec![GITIGNORE_FILE.to_string(), DEFAULT_METADATA_FILE.to_string()]);
        assert_eq!(store.snapshot().await, CacheRoot::default());
    }

    #[tokio::test]
    async fn verify_repairs_invariant() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        png(&fetcher, "https://img.test/b.png");
        let store = open(&storage, &fetcher).await;
        let a = store
            .fetch_or_download(&req("https://img.test/a.png", "d.md"), false)
            .await
            .unwrap();
        store
            .fetch_or_download(&req("https://img.test/b.png", "d.md"), false)
            .await
            .unwrap();

        storage.remove(&a.path).await.unwrap();
        storage.put(&PathBuf::from(DIR).join("0123456789abcdef.png"), b"stray");

        let report = store.verify().await.unwrap();
        assert_eq!(report.missing_blobs, vec![a.key]);
        assert_eq!(report.orphan_files, vec!["0123456789abcdef.png".to_string()]);
        assert_eq!(store.snapshot().await.items.len(), 1);

        assert!(store.verify().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn collect_garbage_removes_unretained() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        png(&fetcher, "https://img.test/a.png");
        png(&fetcher, "https://img.test/b.png");
        let store = open(&storage, &fetcher).await;
        let a = req("https://img.test/a.png", "d.md");
        store.fetch_or_download(&a, false).await.unwrap();
        let b = store
            .fetch_or_download(&req("https://img.test/b.png", "d.md"), false)
            .await
            .unwrap();
        store
            .update_retained_caches(&[a], "d.md", &RetainOptions::default())
            .await
            .unwrap();

        assert_eq!(store.collect_garbage().await.unwrap(), vec![b.key]);
        let stats = store.stats().await;
        assert_eq!(stats.items, 1);
        assert_eq!(stats.unretained, 0);
    }

    /// Every key's count equals the records naming it; an entry and its
    /// blob exist exactly while that count is above zero
    async fn assert_retain_counts_consistent(
        store: &CacheStore,
        storage: &MemoryStorage,
        blobs: &std::collections::HashMap<CacheKey, PathBuf>,
    ) {
        let root = store.snapshot().await;
        for (key, path) in blobs {
            let expected = root
                .retainers
                .values()
                .filter(|record| record.refs.contains(key))
                .count();
            assert_eq!(store.retain_count(key).await, expected, "count of {}", key);
            assert_eq!(root.items.contains_key(key), expected > 0, "item {}", key);
            assert_eq!(storage.contains(path), expected > 0, "blob {}", key);
        }
    }

    #[tokio::test]
    async fn retain_counts_stay_consistent_across_retainers() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let url = |n: u32| format!("https://img.test/{}.png", n);
        for n in 1..=5 {
            png(&fetcher, &url(n));
        }
        let store = open(&storage, &fetcher).await;
        let mut blobs = std::collections::HashMap::new();

        // (retainer, images, prevent_releases)
        let steps: &[(&str, &[u32], bool)] = &[
            ("a.md", &[1, 2], false),
            ("b.md", &[2, 3], false),
            ("c.md", &[3, 4, 5], false),
            ("a.md", &[5], false),
            ("d.md", &[1, 2], false),
            ("b.md", &[], false),
            ("c.md", &[4], true),
            ("c.md", &[4], false),
            ("a.md", &[], false),
            ("d.md", &[1, 2, 4], false),
            ("c.md", &[], false),
        ];

        for (retainer, images, prevent_releases) in steps {
            let mut requests = Vec::new();
            for n in images.iter() {
                let r = req(&url(*n), retainer);
                let item = store.fetch_or_download(&r, false).await.unwrap();
                blobs.insert(item.key.clone(), item.path.clone());
                requests.push(r);
            }
            let options = RetainOptions {
                prevent_releases: *prevent_releases,
                ..Default::default()
            };
            store
                .update_retained_caches(&requests, retainer, &options)
                .await
                .unwrap();
            assert_retain_counts_consistent(&store, &storage, &blobs).await;
        }

        // Only d.md is left, holding 1, 2 and 4
        let root = store.snapshot().await;
        assert_eq!(root.retainers.keys().map(String::as_str).collect::<Vec<_>>(), vec!["d.md"]);
        assert_eq!(root.items.len(), 3);
    }
}
