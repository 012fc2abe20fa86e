//! Document reconciliation
//!
//! Keeps the cache's retain sets in step with what documents reference.
//! The render side talks to the [`Reconciler`] through [`PlaceholderView`];
//! every pass commits through one [`SerialQueue`].

pub mod placeholder;
pub mod queue;
pub mod reconciler;
pub mod state;

pub use placeholder::{
    PlaceholderId, PlaceholderRecord, PlaceholderTable, PlaceholderView, RenderedPlaceholder,
    ViewContext,
};
pub use queue::SerialQueue;
pub use reconciler::{AbortReason, PassFailure, PassReport, Reconciler, SyncEvent, SyncOptions};
pub use state::{ElementEvent, ElementState};
