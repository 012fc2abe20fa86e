//! Reconciliation pass
//!
//! A pass runs in two halves. The synchronous half observes the rendered
//! placeholders, resets edited ones, blocks native loading, and claims the
//! eligible ones. The asynchronous half runs on the [`SerialQueue`]: it
//! groups claims by cache key, resolves each group once, fans results out,
//! and commits the document's retained set to the store.

use crate::cache::key::{CacheKey, CacheRequest};
use crate::cache::metadata::CacheItem;
use crate::cache::store::{CacheStore, RetainOptions};
use crate::config::{Config, FullScanPolicy};
use crate::error::{CacheError, CacheResult, ImgkeepResult};
use crate::sync::placeholder::{
    PlaceholderId, PlaceholderRecord, PlaceholderTable, PlaceholderView, ViewContext,
};
use crate::sync::queue::SerialQueue;
use crate::sync::state::{ElementEvent, ElementState};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Reconciler settings
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub full_scan: FullScanPolicy,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            full_scan: config.sync.full_scan,
        }
    }

    fn scans_document(&self, structural: bool) -> bool {
        match self.full_scan {
            FullScanPolicy::Always => true,
            FullScanPolicy::Structural => structural,
            FullScanPolicy::Never => false,
        }
    }
}

/// Change notification from the view side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Document shown for the first time
    Opened,
    DocumentChanged { structural: bool },
    ViewportChanged,
    ChunkRendered,
    PlaceholderRemoved(PlaceholderId),
    DocumentRenamed { from: String, to: String },
    DocumentDeleted { path: String },
    /// View closed; its placeholder records are discarded, references kept
    DocumentClosed { path: String },
}

impl SyncEvent {
    fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Opened | Self::DocumentChanged { structural: true }
        )
    }
}

/// Why a pass stopped before touching the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    /// Nothing eligible and no structural change
    NothingToDo,
    /// The view closed or switched documents mid-pass
    ContextInvalid,
}

/// A group that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassFailure {
    pub locator: String,
    pub error: String,
    pub retryable: bool,
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub document: String,
    /// Placeholders claimed by this pass
    pub selected: usize,
    /// Distinct cache requests among them
    pub groups: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub invalid: usize,
    /// Requests sent to the store as the retained set
    pub retained: usize,
    pub full_scan: bool,
    pub added: Vec<CacheKey>,
    pub removed: Vec<CacheKey>,
    pub deleted: Vec<CacheKey>,
    pub failures: Vec<PassFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortReason>,
}

impl PassReport {
    fn aborted(document: impl Into<String>, reason: AbortReason) -> Self {
        Self {
            document: document.into(),
            aborted: Some(reason),
            ..Default::default()
        }
    }
}

type Tables = Arc<Mutex<HashMap<String, PlaceholderTable>>>;

fn lock_tables(tables: &Mutex<HashMap<String, PlaceholderTable>>) -> MutexGuard<'_, HashMap<String, PlaceholderTable>> {
    tables.lock().unwrap_or_else(|e| e.into_inner())
}

/// Placeholders sharing one cache request
struct Group {
    request: CacheRequest,
    members: Vec<(PlaceholderId, String)>,
}

/// Everything the queued half of a pass needs
struct PendingPass {
    store: Arc<CacheStore>,
    tables: Tables,
    view: Arc<dyn PlaceholderView>,
    context: ViewContext,
    claimed: Vec<(PlaceholderId, CacheRequest)>,
    /// Valid locators rendered outside the viewport
    outside_viewport: Vec<String>,
    /// Whole-document locators when this pass scanned the document
    document_locators: Option<Vec<String>>,
}

/// Drives passes for every open document
pub struct Reconciler {
    store: Arc<CacheStore>,
    queue: Arc<SerialQueue>,
    tables: Tables,
    options: SyncOptions,
}

impl Reconciler {
    pub fn new(store: Arc<CacheStore>, queue: Arc<SerialQueue>, options: SyncOptions) -> Self {
        Self {
            store,
            queue,
            tables: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Current state of one placeholder
    pub fn placeholder_state(&self, document: &str, id: PlaceholderId) -> Option<ElementState> {
        lock_tables(&self.tables).get(document)?.state(id)
    }

    /// Snapshot of a document's placeholder records, sorted by id
    pub fn placeholders(&self, document: &str) -> Vec<(PlaceholderId, PlaceholderRecord)> {
        let tables = lock_tables(&self.tables);
        let mut records: Vec<_> = tables
            .get(document)
            .map(|table| table.iter().map(|(id, r)| (id, r.clone())).collect())
            .unwrap_or_default();
        records.sort_by_key(|(id, _)| *id);
        records
    }

    /// React to one view event
    pub async fn handle(
        &self,
        view: Arc<dyn PlaceholderView>,
        event: SyncEvent,
    ) -> ImgkeepResult<PassReport> {
        match &event {
            SyncEvent::DocumentRenamed { from, to } => {
                return self.document_renamed(from.clone(), to.clone()).await
            }
            SyncEvent::DocumentDeleted { path } => return self.document_deleted(path.clone()).await,
            SyncEvent::DocumentClosed { path } => return self.document_closed(path.clone()).await,
            SyncEvent::PlaceholderRemoved(id) => {
                let id = *id;
                if let Some(context) = view.context() {
                    if let Some(table) = lock_tables(&self.tables).get_mut(&context.document_path) {
                        table.remove(id);
                    }
                }
            }
            _ => {}
        }

        let structural = event.is_structural();
        let Some(context) = view.context() else {
            return Ok(PassReport::aborted("", AbortReason::ContextInvalid));
        };
        let document = context.document_path.clone();
        let full_scan = self.options.scans_document(structural);

        let rendered = view.rendered();
        let mut claimed = Vec::new();
        let mut outside_viewport = Vec::new();
        {
            let mut tables = lock_tables(&self.tables);
            let table = tables.entry(document.clone()).or_default();

            let ids: HashSet<PlaceholderId> = rendered.iter().map(|p| p.id).collect();
            table.retain_rendered(&ids);
            // Edited locators reset before anything is classified
            for placeholder in &rendered {
                table.observe(placeholder.id, &placeholder.locator);
            }

            for placeholder in &rendered {
                let request = CacheRequest::new(placeholder.locator.as_str(), document.as_str());
                if self.store.validate_request(&request).is_err() {
                    continue;
                }
                if !placeholder.in_viewport {
                    outside_viewport.push(placeholder.locator.clone());
                    continue;
                }

                let Some(state) = table.state(placeholder.id) else {
                    continue;
                };
                if !state.is_selectable() {
                    continue;
                }
                if state == ElementState::Original {
                    if table
                        .apply(placeholder.id, &placeholder.locator, ElementEvent::SourceAccepted)
                        .is_none()
                    {
                        continue;
                    }
                    view.block_native_load(placeholder.id);
                }
                if table
                    .apply(placeholder.id, &placeholder.locator, ElementEvent::Selected)
                    .is_some()
                {
                    claimed.push((placeholder.id, request));
                }
            }
        }

        if claimed.is_empty() && !structural {
            debug!(document = %document, "nothing to reconcile");
            return Ok(PassReport::aborted(document, AbortReason::NothingToDo));
        }

        let document_locators = full_scan.then(|| view.document_locators());
        let pending = PendingPass {
            store: Arc::clone(&self.store),
            tables: Arc::clone(&self.tables),
            view,
            context,
            claimed,
            outside_viewport,
            document_locators,
        };

        self.queue.run(pending.run()).await?
    }

    async fn document_renamed(&self, from: String, to: String) -> ImgkeepResult<PassReport> {
        let store = Arc::clone(&self.store);
        let tables = Arc::clone(&self.tables);

        self.queue
            .run(async move {
                store.rename_retainer(&from, &to).await?;
                save_quietly(&store).await;

                let mut tables = lock_tables(&tables);
                if let Some(table) = tables.remove(&from) {
                    tables.insert(to.clone(), table);
                }
                Ok(PassReport {
                    document: to,
                    ..Default::default()
                })
            })
            .await?
    }

    async fn document_deleted(&self, path: String) -> ImgkeepResult<PassReport> {
        let store = Arc::clone(&self.store);
        let tables = Arc::clone(&self.tables);

        self.queue
            .run(async move {
                let outcome = store.remove_retainer(&path).await?;
                save_quietly(&store).await;
                lock_tables(&tables).remove(&path);
                Ok(PassReport {
                    document: path,
                    removed: outcome.removed,
                    deleted: outcome.deleted,
                    ..Default::default()
                })
            })
            .await?
    }

    async fn document_closed(&self, path: String) -> ImgkeepResult<PassReport> {
        let tables = Arc::clone(&self.tables);

        // Runs behind any pass already queued for this document
        self.queue
            .run(async move {
                if let Some(table) = lock_tables(&tables).remove(&path) {
                    debug!(document = %path, placeholders = table.len(), "discarded placeholder state");
                }
                PassReport {
                    document: path,
                    ..Default::default()
                }
            })
            .await
    }
}

impl PendingPass {
    fn document(&self) -> &str {
        &self.context.document_path
    }

    fn context_valid(&self) -> bool {
        self.view.context().as_ref() == Some(&self.context)
    }

    async fn run(self) -> ImgkeepResult<PassReport> {
        let document = self.document().to_string();
        let mut report = PassReport {
            document: document.clone(),
            selected: self.claimed.len(),
            full_scan: self.document_locators.is_some(),
            ..Default::default()
        };

        let groups = self.group_claims();
        report.groups = groups.len();

        if !self.context_valid() {
            self.abandon(&groups);
            info!(document = %document, "view changed before pass started, abandoning");
            return Ok(PassReport::aborted(document, AbortReason::ContextInvalid));
        }

        let results = join_all(groups.iter().map(|group| self.resolve(group))).await;

        if !self.context_valid() {
            self.abandon(&groups);
            info!(document = %document, "view changed during pass, abandoning");
            let mut report = PassReport::aborted(document, AbortReason::ContextInvalid);
            report.added = self.keep_resolved(&groups, &results).await;
            return Ok(report);
        }

        for (group, (result, hit)) in groups.iter().zip(results) {
            self.fan_out(group, result, hit, &mut report);
        }

        let (retained, ignored) = self.retained_set();
        report.retained = retained.len();
        let options = RetainOptions {
            requests_to_ignore: ignored,
            prevent_releases: !report.full_scan,
        };

        let outcome = self
            .store
            .update_retained_caches(&retained, &document, &options)
            .await?;
        save_quietly(&self.store).await;

        report.added = outcome.added;
        report.removed = outcome.removed;
        report.deleted = outcome.deleted;

        info!(
            document = %document,
            selected = report.selected,
            groups = report.groups,
            succeeded = report.succeeded,
            failed = report.failed,
            invalid = report.invalid,
            deleted = report.deleted.len(),
            "reconciled document"
        );
        Ok(report)
    }

    /// Add-only retain of what an abandoned pass already resolved, so its
    /// downloads are not left unreferenced. A later rename or delete of the
    /// document runs after this on the queue and carries the refs along.
    async fn keep_resolved(
        &self,
        groups: &[Group],
        results: &[(CacheResult<CacheItem>, bool)],
    ) -> Vec<CacheKey> {
        let resolved: Vec<CacheRequest> = groups
            .iter()
            .zip(results)
            .filter(|(_, (result, _))| result.is_ok())
            .map(|(group, _)| group.request.clone())
            .collect();
        if resolved.is_empty() {
            return Vec::new();
        }

        let options = RetainOptions {
            requests_to_ignore: Vec::new(),
            prevent_releases: true,
        };
        match self
            .store
            .update_retained_caches(&resolved, self.document(), &options)
            .await
        {
            Ok(outcome) => {
                save_quietly(&self.store).await;
                outcome.added
            }
            Err(e) => {
                warn!(document = %self.document(), "Failed to retain abandoned downloads: {}", e);
                Vec::new()
            }
        }
    }

    /// Same cache key, same group; one store call per group
    fn group_claims(&self) -> Vec<Group> {
        let mut groups: BTreeMap<CacheKey, Group> = BTreeMap::new();
        for (id, request) in &self.claimed {
            groups
                .entry(request.key())
                .or_insert_with(|| Group {
                    request: request.clone(),
                    members: Vec::new(),
                })
                .members
                .push((*id, request.source.clone()));
        }
        groups.into_values().collect()
    }

    /// Returns the group's result and whether it was a local hit
    async fn resolve(&self, group: &Group) -> (CacheResult<CacheItem>, bool) {
        match self.store.lookup(&group.request, false).await {
            Ok(lookup) if lookup.is_usable() => {
                if let Some(item) = lookup.item {
                    if let Err(e) = self.store.touch(&item.key).await {
                        debug!(key = %item.key, "touch failed: {}", e);
                    }
                    return (Ok(item), true);
                }
            }
            Ok(_) => {}
            Err(e) => return (Err(e), false),
        }

        self.transition_members(group, ElementEvent::CacheMiss);
        (self.store.fetch_or_download(&group.request, false).await, false)
    }

    fn transition_members(&self, group: &Group, event: ElementEvent) {
        let mut tables = lock_tables(&self.tables);
        let Some(table) = tables.get_mut(self.document()) else {
            return;
        };
        for (id, locator) in &group.members {
            table.apply(*id, locator, event);
        }
    }

    fn abandon(&self, groups: &[Group]) {
        for group in groups {
            self.transition_members(group, ElementEvent::Abandoned);
        }
    }

    fn fan_out(
        &self,
        group: &Group,
        result: CacheResult<CacheItem>,
        hit: bool,
        report: &mut PassReport,
    ) {
        let mut tables = lock_tables(&self.tables);
        let Some(table) = tables.get_mut(self.document()) else {
            return;
        };

        match result {
            Ok(item) => {
                let event = if hit {
                    ElementEvent::CacheHit
                } else {
                    ElementEvent::FetchSucceeded
                };
                for (id, locator) in &group.members {
                    if table.apply(*id, locator, event).is_some() {
                        self.view.apply_resource(*id, &item);
                        report.succeeded += 1;
                    }
                }
            }
            Err(error) => {
                let retryable = error.is_retryable();
                warn!(locator = %group.request.source, retryable, "Image request failed: {}", error);
                report.failures.push(PassFailure {
                    locator: group.request.source.clone(),
                    error: error.to_string(),
                    retryable,
                });
                for (id, locator) in &group.members {
                    match table.apply(*id, locator, ElementEvent::FetchFailed { retryable }) {
                        Some(state @ ElementState::Failed) => {
                            self.view.mark_failed(*id, state, &error);
                            report.failed += 1;
                        }
                        Some(state @ ElementState::Invalid) => {
                            self.view.mark_failed(*id, state, &error);
                            report.invalid += 1;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Requests to retain, and in-flight requests that must not be released
    fn retained_set(&self) -> (Vec<CacheRequest>, Vec<CacheRequest>) {
        let document = self.document();
        let mut retained: Vec<CacheRequest> = Vec::new();
        let mut ignored: Vec<CacheRequest> = Vec::new();

        {
            let tables = lock_tables(&self.tables);
            if let Some(table) = tables.get(document) {
                for (_, record) in table.iter() {
                    let request = CacheRequest::new(record.locator.as_str(), document);
                    if record.state == ElementState::Succeeded {
                        retained.push(request);
                    } else if record.state.is_in_flight() {
                        ignored.push(request);
                    }
                }
            }
        }

        retained.extend(
            self.outside_viewport
                .iter()
                .map(|locator| CacheRequest::new(locator.as_str(), document)),
        );
        if let Some(locators) = &self.document_locators {
            retained.extend(
                locators
                    .iter()
                    .map(|locator| CacheRequest::new(locator.as_str(), document)),
            );
        }

        (retained, ignored)
    }
}

async fn save_quietly(store: &CacheStore) {
    // Failure keeps the dirty flag; the next pass retries
    if let Err(e) = store.save_if_dirty().await {
        debug!("deferring metadata save: {}", e);
    }
}
