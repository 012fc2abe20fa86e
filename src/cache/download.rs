//! Download coordinator
//!
//! One network fetch per cache key at a time. A second requester for a key
//! that is already downloading joins the first download's shared future.
//!
//! Commit order: blob first, then metadata. If the metadata write fails the
//! blob is deleted. A previous record is restored only when its blob was not
//! overwritten; otherwise the entry is dropped.

use crate::cache::fetch::Fetcher;
use crate::cache::key::{BlobName, CacheKey, CacheRequest};
use crate::cache::metadata::{CacheItem, CacheKind, CacheMetadata, FileInfo, TimeInfo};
use crate::cache::probe::{extension_matches, probe_image};
use crate::cache::store::StoreShared;
use crate::error::{CacheError, CacheResult};
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

type SharedDownload = Shared<BoxFuture<'static, CacheResult<CacheItem>>>;

struct InFlightDownload {
    ticket: u64,
    future: SharedDownload,
    abort: AbortHandle,
}

#[derive(Default)]
struct InFlight {
    downloads: HashMap<CacheKey, InFlightDownload>,
    next_ticket: u64,
}

/// Deduplicates and performs downloads for one store
pub(crate) struct DownloadCoordinator {
    shared: Arc<StoreShared>,
    fetcher: Arc<dyn Fetcher>,
    max_image_bytes: u64,
    in_flight: Arc<Mutex<InFlight>>,
}

impl DownloadCoordinator {
    pub(crate) fn new(shared: Arc<StoreShared>, fetcher: Arc<dyn Fetcher>, max_image_bytes: u64) -> Self {
        Self {
            shared,
            fetcher,
            max_image_bytes,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    fn registry(&self) -> MutexGuard<'_, InFlight> {
        lock_registry(&self.in_flight)
    }

    /// Download `req`, or join the download already running for its key
    pub(crate) async fn download(&self, req: &CacheRequest, name: BlobName) -> CacheResult<CacheItem> {
        let key = req.key();
        let future = {
            let mut registry = self.registry();
            match registry.downloads.get(&key) {
                Some(existing) => {
                    debug!(%key, "joining in-flight download");
                    existing.future.clone()
                }
                None => {
                    let ticket = registry.next_ticket;
                    registry.next_ticket += 1;
                    let url = req.source.trim().to_string();

                    let job = DownloadJob {
                        shared: Arc::clone(&self.shared),
                        fetcher: Arc::clone(&self.fetcher),
                        max_image_bytes: self.max_image_bytes,
                        url: url.clone(),
                        key: key.clone(),
                        name,
                    };
                    let guard = RegistryEntryGuard {
                        in_flight: Arc::clone(&self.in_flight),
                        key: key.clone(),
                        ticket,
                    };
                    let task = tokio::spawn(async move {
                        let _guard = guard;
                        job.run().await
                    });
                    let abort = task.abort_handle();

                    let future = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(CacheError::Fetch {
                                url,
                                status: None,
                                reason: if e.is_cancelled() {
                                    "download cancelled".to_string()
                                } else {
                                    format!("download task failed: {}", e)
                                },
                                is_retryable: true,
                                is_internet_disconnected: false,
                            }),
                        }
                    }
                    .boxed()
                    .shared();

                    registry.downloads.insert(
                        key.clone(),
                        InFlightDownload {
                            ticket,
                            future: future.clone(),
                            abort,
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Abort every running download; returns how many were aborted
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<InFlightDownload> = self.registry().downloads.drain().map(|(_, d)| d).collect();
        for download in &drained {
            download.abort.abort();
        }
        if !drained.is_empty() {
            info!(cancelled = drained.len(), "cancelled in-flight downloads");
        }
        drained.len()
    }

    pub(crate) fn in_flight_keys(&self) -> HashSet<CacheKey> {
        self.registry().downloads.keys().cloned().collect()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.registry().downloads.len()
    }
}

fn lock_registry(registry: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owned by the spawned download task. Unregisters the download when the
/// task finishes or is aborted, whether or not any waiter is still polling.
struct RegistryEntryGuard {
    in_flight: Arc<Mutex<InFlight>>,
    key: CacheKey,
    ticket: u64,
}

impl Drop for RegistryEntryGuard {
    fn drop(&mut self) {
        let mut registry = lock_registry(&self.in_flight);
        if registry
            .downloads
            .get(&self.key)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            registry.downloads.remove(&self.key);
        }
    }
}

/// One fetch-validate-write-commit run
struct DownloadJob {
    shared: Arc<StoreShared>,
    fetcher: Arc<dyn Fetcher>,
    max_image_bytes: u64,
    url: String,
    key: CacheKey,
    name: BlobName,
}

impl DownloadJob {
    async fn run(self) -> CacheResult<CacheItem> {
        let generation = self.shared.state.lock().await.generation;
        let url = self.url.as_str();

        let response = self.fetcher.fetch(url).await?;

        if !(200..300).contains(&response.status) {
            debug!(url, status = response.status, "download rejected by status");
            return Err(CacheError::status(url, response.status));
        }
        if response.is_no_store() {
            return Err(CacheError::Fetch {
                url: url.to_string(),
                status: Some(response.status),
                reason: "server forbids caching (Cache-Control: no-store)".to_string(),
                is_retryable: false,
                is_internet_disconnected: false,
            });
        }
        if response.body.len() as u64 > self.max_image_bytes {
            return Err(CacheError::Fetch {
                url: url.to_string(),
                status: Some(response.status),
                reason: format!(
                    "payload of {} bytes exceeds the {} byte limit",
                    response.body.len(),
                    self.max_image_bytes
                ),
                is_retryable: false,
                is_internet_disconnected: false,
            });
        }

        let probed = probe_image(&response.body, response.content_type()).map_err(|reason| {
            CacheError::Type {
                url: url.to_string(),
                reason,
            }
        })?;

        let extension = match self.name.extension.as_deref() {
            Some(ext) if extension_matches(ext, probed.extension) => ext.to_string(),
            _ => probed.extension.to_string(),
        };
        let file_name = self.key.blob_file_name(Some(&extension));
        let path = self.shared.layout.dir().join(&file_name);

        if let Err(e) = self.shared.storage.write_binary(&path, &response.body).await {
            let _ = self.shared.storage.remove(&path).await;
            return Err(CacheError::storage(format!("writing {}", path.display()), e));
        }

        let now = Utc::now();
        let metadata = CacheMetadata {
            kind: CacheKind::Image,
            file: FileInfo {
                source_url: url.to_string(),
                name: self.name.file_name.clone(),
                extension: Some(extension),
                size_bytes: response.body.len() as u64,
                content_type: response.content_type().map(str::to_string),
                content_hash: hex::encode(Sha256::digest(&response.body)),
            },
            image: Some(probed.info),
            time: TimeInfo {
                downloaded_at: now,
                last_access_at: now,
                cache_control: response.cache_control().map(str::to_string),
            },
        };

        self.commit(generation, metadata, file_name).await
    }

    async fn commit(
        &self,
        generation: u64,
        metadata: CacheMetadata,
        file_name: String,
    ) -> CacheResult<CacheItem> {
        let storage = &self.shared.storage;
        let path = self.shared.layout.dir().join(&file_name);
        let mut state = self.shared.state.lock().await;

        if state.generation != generation {
            drop(state);
            let _ = storage.remove(&path).await;
            return Err(CacheError::Fetch {
                url: self.url.clone(),
                status: None,
                reason: "cache was cleared during download".to_string(),
                is_retryable: true,
                is_internet_disconnected: false,
            });
        }

        let previous = state.root.items.insert(self.key.clone(), metadata.clone());

        if let Err(e) = self.shared.persist_locked(&mut state).await {
            warn!(key = %self.key, "Rolling back download after metadata write failed: {}", e);
            match previous {
                // Old blob untouched under another name; its record still holds
                Some(prev) if prev.blob_file_name(&self.key) != file_name => {
                    state.root.items.insert(self.key.clone(), prev);
                }
                // New bytes already replaced the old blob, so the old record
                // no longer describes it. Drop both.
                Some(_) => {
                    state.root.items.remove(&self.key);
                    state.root.prune_dangling();
                    state.dirty = true;
                }
                None => {
                    state.root.items.remove(&self.key);
                }
            }
            if let Err(remove_err) = storage.remove(&path).await {
                warn!(key = %self.key, "Failed to remove blob {}: {}", path.display(), remove_err);
            }
            return Err(e);
        }

        if let Some(prev) = previous {
            let old_name = prev.blob_file_name(&self.key);
            if old_name != file_name {
                let _ = storage.remove(&self.shared.layout.dir().join(old_name)).await;
            }
        }

        info!(key = %self.key, url = %self.url, bytes = metadata.file.size_bytes, "cached image");
        Ok(CacheItem {
            key: self.key.clone(),
            metadata,
            path,
        })
    }
}
