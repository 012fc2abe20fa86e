//! Placeholder identity, state table, and the view collaborator
//!
//! The view owns rendering; the reconciler owns state. Placeholders are
//! addressed by a [`PlaceholderId`] the view assigns when it first renders
//! one, and the table maps that id to its locator and [`ElementState`].

use crate::cache::metadata::CacheItem;
use crate::error::CacheError;
use crate::sync::state::{ElementEvent, ElementState};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Stable identity of a rendered placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PlaceholderId(pub u64);

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One placeholder as currently rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPlaceholder {
    pub id: PlaceholderId,
    pub locator: String,
    pub in_viewport: bool,
}

/// Document the view is showing. Two contexts differ when the view was
/// pointed at another document or reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewContext {
    /// Retainer path of the shown document
    pub document_path: String,
    pub epoch: u64,
}

/// Render-side collaborator of a reconciliation pass
pub trait PlaceholderView: Send + Sync {
    /// Current context; `None` once the view is closed
    fn context(&self) -> Option<ViewContext>;

    /// Placeholders currently rendered
    fn rendered(&self) -> Vec<RenderedPlaceholder>;

    /// Every locator in the whole document, rendered or not
    fn document_locators(&self) -> Vec<String>;

    /// Stash and clear the native reference so the host does not load it
    fn block_native_load(&self, id: PlaceholderId);

    /// Point the placeholder at the cached blob
    fn apply_resource(&self, id: PlaceholderId, item: &CacheItem);

    /// Show a failure indicator for a `Failed` or `Invalid` placeholder
    fn mark_failed(&self, id: PlaceholderId, state: ElementState, error: &CacheError);
}

/// State held for one placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderRecord {
    pub locator: String,
    pub state: ElementState,
}

/// What [`PlaceholderTable::observe`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Unchanged,
    /// Locator differs from the recorded one; state was reset
    LocatorChanged,
}

/// Placeholder states for one document
#[derive(Debug, Default, Clone)]
pub struct PlaceholderTable {
    records: HashMap<PlaceholderId, PlaceholderRecord>,
}

impl PlaceholderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rendered placeholder, resetting it if its locator changed
    pub fn observe(&mut self, id: PlaceholderId, locator: &str) -> Observation {
        match self.records.get_mut(&id) {
            None => {
                self.records.insert(
                    id,
                    PlaceholderRecord {
                        locator: locator.to_string(),
                        state: ElementState::Original,
                    },
                );
                Observation::New
            }
            Some(record) if record.locator == locator => Observation::Unchanged,
            Some(record) => {
                debug!(%id, from = %record.state, "locator changed, resetting placeholder");
                record.state = record
                    .state
                    .transition(ElementEvent::LocatorChanged)
                    .unwrap_or(ElementState::Original);
                record.locator = locator.to_string();
                Observation::LocatorChanged
            }
        }
    }

    /// Apply `event` if the placeholder still shows `locator`.
    ///
    /// Returns the new state, or `None` when the placeholder moved on or the
    /// transition is not allowed.
    pub fn apply(
        &mut self,
        id: PlaceholderId,
        locator: &str,
        event: ElementEvent,
    ) -> Option<ElementState> {
        let record = self.records.get_mut(&id)?;
        if record.locator != locator {
            debug!(%id, "ignoring result for a stale locator");
            return None;
        }
        match record.state.transition(event) {
            Some(next) => {
                record.state = next;
                Some(next)
            }
            None => {
                debug!(%id, state = %record.state, ?event, "rejected transition");
                None
            }
        }
    }

    /// Forget placeholders that are no longer rendered
    pub fn retain_rendered(&mut self, rendered: &HashSet<PlaceholderId>) -> usize {
        let before = self.records.len();
        self.records.retain(|id, _| rendered.contains(id));
        before - self.records.len()
    }

    pub fn remove(&mut self, id: PlaceholderId) -> Option<PlaceholderRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: PlaceholderId) -> Option<&PlaceholderRecord> {
        self.records.get(&id)
    }

    pub fn state(&self, id: PlaceholderId) -> Option<ElementState> {
        self.records.get(&id).map(|r| r.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlaceholderId, &PlaceholderRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
