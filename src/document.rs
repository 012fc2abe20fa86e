//! Markdown documents as placeholder views
//!
//! Image references are found with a small scanner that understands
//! `![alt](url "title")`, `![alt](<url>)`, and raw `<img src="...">` tags,
//! and skips fenced code blocks. Placeholder ids are occurrence indexes, so
//! editing a locator in place keeps its id and resets its state.

use crate::cache::metadata::CacheItem;
use crate::error::{CacheError, ImgkeepError, ImgkeepResult};
use crate::sync::placeholder::{PlaceholderId, PlaceholderView, RenderedPlaceholder, ViewContext};
use crate::sync::state::ElementState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// One image reference in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub locator: String,
    /// Byte offset of the reference in the source text
    pub offset: usize,
}

/// Find every image reference in `text`, in document order
pub fn scan_image_refs(text: &str) -> Vec<ImageRef> {
    let mut refs = Vec::new();
    let mut offset = 0;
    let mut fence: Option<&str> = None;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let marker = ["```", "~~~"].into_iter().find(|m| trimmed.starts_with(m));
        match (fence, marker) {
            (None, Some(m)) => fence = Some(m),
            (Some(open), Some(m)) if open == m => fence = None,
            (None, None) => {
                scan_markdown_images(line, offset, &mut refs);
                scan_html_images(line, offset, &mut refs);
            }
            _ => {}
        }
        offset += line.len();
    }

    refs.sort_by_key(|r| r.offset);
    refs
}

fn scan_markdown_images(line: &str, base: usize, refs: &mut Vec<ImageRef>) {
    let mut search_from = 0;
    while let Some(idx) = line[search_from..].find("![") {
        let start = search_from + idx;
        let alt_start = start + 2;
        let Some(close) = line[alt_start..].find("](") else {
            break;
        };
        let dest_start = alt_start + close + 2;
        match parse_destination(&line[dest_start..]) {
            Some((locator, consumed)) => {
                refs.push(ImageRef {
                    locator,
                    offset: base + start,
                });
                search_from = dest_start + consumed;
            }
            None => search_from = alt_start,
        }
    }
}

/// Parse `url "title")` or `<url>)`; returns the url and bytes consumed
fn parse_destination(rest: &str) -> Option<(String, usize)> {
    let trimmed = rest.trim_start();
    let lead = rest.len() - trimmed.len();

    if let Some(inner) = trimmed.strip_prefix('<') {
        let end = inner.find('>')?;
        let after = inner[end + 1..].find(')')?;
        return Some((inner[..end].trim().to_string(), lead + 1 + end + 1 + after + 1));
    }

    let mut depth = 0usize;
    let mut url_end = None;
    for (i, c) in trimmed.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => {
                url_end = Some(i);
                break;
            }
            ')' => depth -= 1,
            c if c.is_whitespace() => {
                url_end = Some(i);
                break;
            }
            _ => {}
        }
    }
    let url_end = url_end?;
    let close = trimmed[url_end..].find(')')? + url_end;
    Some((trimmed[..url_end].to_string(), lead + close + 1))
}

fn scan_html_images(line: &str, base: usize, refs: &mut Vec<ImageRef>) {
    let lower = line.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(idx) = lower[search_from..].find("<img") {
        let start = search_from + idx;
        let tag_end = lower[start..].find('>').map_or(line.len(), |e| start + e);
        if let Some(src) = find_src_attr(&line[start..tag_end], &lower[start..tag_end]) {
            refs.push(ImageRef {
                locator: src,
                offset: base + start,
            });
        }
        search_from = tag_end.max(start + 4);
        if search_from >= line.len() {
            break;
        }
    }
}

fn find_src_attr(tag: &str, lower: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(idx) = lower[search_from..].find("src") {
        let start = search_from + idx;
        search_from = start + 3;
        // Must be a whole attribute name
        if !lower[..start].ends_with(|c: char| c.is_whitespace()) {
            continue;
        }
        let rest = tag[start + 3..].trim_start();
        let Some(value) = rest.strip_prefix('=') else {
            continue;
        };
        let value = value.trim_start();
        let quoted = value
            .strip_prefix('"')
            .and_then(|v| v.find('"').map(|end| &v[..end]))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|v| v.find('\'').map(|end| &v[..end]))
            });
        let src = match quoted {
            Some(src) => src,
            None => value
                .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
                .next()
                .unwrap_or(""),
        };
        return Some(src.trim().to_string());
    }
    None
}

/// Canonical retainer path for a document; falls back to an absolute path
/// when the file no longer exists
pub async fn retainer_path(path: &Path) -> ImgkeepResult<String> {
    let resolved = match tokio::fs::canonicalize(path).await {
        Ok(p) => p,
        Err(_) if path.is_absolute() => path.to_path_buf(),
        Err(_) => std::env::current_dir()
            .map_err(|e| ImgkeepError::io("getting current directory", e))?
            .join(path),
    };
    Ok(resolved.to_string_lossy().into_owned())
}

/// What happened to one placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PlaceholderOutcome {
    /// Native load blocked, result pending
    Blocked,
    Cached { path: PathBuf },
    Failed { state: ElementState, error: String },
}

#[derive(Debug)]
struct ViewState {
    document_path: String,
    epoch: u64,
    closed: bool,
    refs: Vec<ImageRef>,
    viewport: Option<Range<usize>>,
    outcomes: BTreeMap<PlaceholderId, PlaceholderOutcome>,
}

/// A Markdown document rendered in full
#[derive(Debug)]
pub struct MarkdownView {
    state: Mutex<ViewState>,
}

impl MarkdownView {
    pub fn new(document_path: impl Into<String>, text: &str) -> Self {
        Self {
            state: Mutex::new(ViewState {
                document_path: document_path.into(),
                epoch: 0,
                closed: false,
                refs: scan_image_refs(text),
                viewport: None,
                outcomes: BTreeMap::new(),
            }),
        }
    }

    /// Read a document from disk
    pub async fn open(path: &Path) -> ImgkeepResult<Self> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImgkeepError::DocumentNotFound(path.to_path_buf()))
            }
            Err(e) => {
                return Err(ImgkeepError::io(format!("reading {}", path.display()), e));
            }
        };
        let document_path = retainer_path(path).await?;
        let view = Self::new(document_path, &text);
        debug!(document = %path.display(), images = view.lock().refs.len(), "opened document");
        Ok(view)
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn document_path(&self) -> String {
        self.lock().document_path.clone()
    }

    pub fn image_refs(&self) -> Vec<ImageRef> {
        self.lock().refs.clone()
    }

    /// Replace the document text
    pub fn set_text(&self, text: &str) {
        let mut state = self.lock();
        state.refs = scan_image_refs(text);
        let count = state.refs.len() as u64;
        state.outcomes.retain(|id, _| id.0 < count);
    }

    /// Limit the viewport to a range of placeholder indexes; `None` shows all
    pub fn set_viewport(&self, viewport: Option<Range<usize>>) {
        self.lock().viewport = viewport;
    }

    /// Point the view at a new path; passes still running are abandoned
    pub fn rename(&self, document_path: impl Into<String>) {
        let mut state = self.lock();
        state.document_path = document_path.into();
        state.epoch += 1;
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Per-placeholder outcomes in document order
    pub fn outcomes(&self) -> Vec<(PlaceholderId, String, Option<PlaceholderOutcome>)> {
        let state = self.lock();
        state
            .refs
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let id = PlaceholderId(i as u64);
                (id, r.locator.clone(), state.outcomes.get(&id).cloned())
            })
            .collect()
    }
}

impl PlaceholderView for MarkdownView {
    fn context(&self) -> Option<ViewContext> {
        let state = self.lock();
        if state.closed {
            return None;
        }
        Some(ViewContext {
            document_path: state.document_path.clone(),
            epoch: state.epoch,
        })
    }

    fn rendered(&self) -> Vec<RenderedPlaceholder> {
        let state = self.lock();
        state
            .refs
            .iter()
            .enumerate()
            .map(|(i, r)| RenderedPlaceholder {
                id: PlaceholderId(i as u64),
                locator: r.locator.clone(),
                in_viewport: state.viewport.as_ref().is_none_or(|v| v.contains(&i)),
            })
            .collect()
    }

    fn document_locators(&self) -> Vec<String> {
        self.lock().refs.iter().map(|r| r.locator.clone()).collect()
    }

    fn block_native_load(&self, id: PlaceholderId) {
        self.lock().outcomes.insert(id, PlaceholderOutcome::Blocked);
    }

    fn apply_resource(&self, id: PlaceholderId, item: &CacheItem) {
        self.lock().outcomes.insert(
            id,
            PlaceholderOutcome::Cached {
                path: item.path.clone(),
            },
        );
    }

    fn mark_failed(&self, id: PlaceholderId, state: ElementState, error: &CacheError) {
        self.lock().outcomes.insert(
            id,
            PlaceholderOutcome::Failed {
                state,
                error: error.to_string(),
            },
        );
    }
}
