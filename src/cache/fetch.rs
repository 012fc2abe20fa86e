//! Network fetch primitive
//!
//! `HttpFetcher` wraps a blocking `ureq` agent; each call runs on the
//! blocking pool so a slow server never stalls the async runtime.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Raw response of one fetch
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.header("cache-control")
    }

    /// Whether the server forbids storing this response
    pub fn is_no_store(&self) -> bool {
        self.cache_control().is_some_and(|value| {
            value
                .split(',')
                .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
        })
    }
}

/// Something that can GET a URL
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`. HTTP error statuses are returned as responses, not errors.
    async fn fetch(&self, url: &str) -> CacheResult<FetchResponse>;
}

/// Settings for [`HttpFetcher`]
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_body_bytes: u64,
}

/// `ureq`-backed fetcher
pub struct HttpFetcher {
    agent: ureq::Agent,
    options: HttpOptions,
}

impl HttpFetcher {
    pub fn new(options: HttpOptions) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(options.timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.into(),
            options,
        }
    }

    fn fetch_blocking(agent: &ureq::Agent, options: &HttpOptions, url: &str) -> CacheResult<FetchResponse> {
        let mut response = agent
            .get(url)
            .header("User-Agent", options.user_agent.as_str())
            .call()
            .map_err(|e| classify_transport_error(url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .body_mut()
            .with_config()
            .limit(options.max_body_bytes)
            .read_to_vec()
            .map_err(|e| classify_transport_error(url, e))?;

        debug!(url, status, bytes = body.len(), "fetched");
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> CacheResult<FetchResponse> {
        let agent = self.agent.clone();
        let options = self.options.clone();
        let owned_url = url.to_string();

        tokio::task::spawn_blocking(move || Self::fetch_blocking(&agent, &options, &owned_url))
            .await
            .map_err(|e| CacheError::Fetch {
                url: url.to_string(),
                status: None,
                reason: format!("fetch task failed: {}", e),
                is_retryable: true,
                is_internet_disconnected: false,
            })?
    }
}

/// Fetcher that replays canned responses, for tests and offline runs
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, CacheResult<FetchResponse>>>,
    calls: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, so concurrent requests overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn respond(&self, url: &str, response: FetchResponse) {
        lock(&self.responses).insert(url.to_string(), Ok(response));
    }

    pub fn fail(&self, url: &str, error: CacheError) {
        lock(&self.responses).insert(url.to_string(), Err(error));
    }

    /// Number of fetches issued for `url`
    pub fn calls(&self, url: &str) -> usize {
        lock(&self.calls).get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> CacheResult<FetchResponse> {
        *lock(&self.calls).entry(url.to_string()).or_insert(0) += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        lock(&self.responses)
            .get(url)
            .cloned()
            .unwrap_or_else(|| {
                Ok(FetchResponse {
                    status: 404,
                    headers: vec![],
                    body: vec![],
                })
            })
    }
}

/// Map a transport error onto the retryable/disconnected flags
fn classify_transport_error(url: &str, err: ureq::Error) -> CacheError {
    let (is_retryable, is_internet_disconnected) = match &err {
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed | ureq::Error::Io(_) => {
            (true, true)
        }
        ureq::Error::Timeout(_) => (true, false),
        ureq::Error::BodyExceedsLimit(_) => (false, false),
        ureq::Error::StatusCode(code) => (*code >= 500 || *code == 429, false),
        _ => (false, false),
    };

    let status = match &err {
        ureq::Error::StatusCode(code) => Some(*code),
        _ => None,
    };

    CacheError::Fetch {
        url: url.to_string(),
        status,
        reason: err.to_string(),
        is_retryable,
        is_internet_disconnected,
    }
}
