//! Cache coordination
//!
//! The [`CacheCoordinator`] sits between a resource loader and the fetch
//! layer. It decides which URLs are cacheable, consults the configured
//! [`CacheBackend`] and tags every result with where it came from. Storage
//! and eviction belong to the backend.

use crate::error::FetchError;
use crate::fetch::FetchedResponse;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use rendergate_common::AbortableOperation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Headers kept by the default [`CacheBackend::prune`].
pub const PRESERVED_HEADERS: [&str; 4] = ["content-type", "etag", "last-modified", "cache-control"];

fn script_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^?#]*\.js(\?[^#]*)?(#.*)?$").expect("static pattern"))
}

/// Whether `url` names a script file: `*.js`, optionally with a query string.
pub fn is_script_url(url: &str) -> bool {
    script_pattern().is_match(url)
}

/// Where a coordinated fetch result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTag {
    /// Not cacheable, or no backend configured
    Bypassed,
    /// Fetched over the network and stored by this request
    JustStored,
    /// Served from an earlier entry
    Retrieved,
}

impl CacheTag {
    pub fn from_cache(self) -> bool {
        self == CacheTag::Retrieved
    }
}

#[derive(Debug, Clone)]
pub struct CachedFetch {
    pub response: FetchedResponse,
    pub tag: CacheTag,
}

/// Pruned, serialisable form of a [`FetchedResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    /// Milliseconds since the Unix epoch
    pub stored_at: u64,
}

impl From<StoredResponse> for FetchedResponse {
    fn from(stored: StoredResponse) -> Self {
        FetchedResponse {
            url: stored.url,
            status: stored.status,
            headers: stored.headers,
            body: stored.body,
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pluggable response store, shared process-wide.
///
/// Implementations must tolerate concurrent use for different keys.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self, key: &str) -> Option<StoredResponse>;

    async fn store(&self, key: &str, entry: StoredResponse, ttl: Option<Duration>);

    /// Lifetime applied to new entries; `None` keeps them until evicted.
    fn expiration(&self) -> Option<Duration>;

    /// Reduces a response to the form that is stored.
    fn prune(&self, response: &FetchedResponse) -> StoredResponse {
        let headers = response
            .headers
            .iter()
            .filter(|(name, _)| {
                PRESERVED_HEADERS
                    .iter()
                    .any(|kept| name.eq_ignore_ascii_case(kept))
            })
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();

        StoredResponse {
            url: response.url.clone(),
            status: response.status,
            headers,
            body: response.body.clone(),
            stored_at: epoch_millis(),
        }
    }
}

struct MemoryEntry {
    response: StoredResponse,
    expires: Option<Instant>,
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    order: VecDeque<String>,
}

/// In-memory [`CacheBackend`] with a TTL and an entry bound.
///
/// When full, the oldest stored entry is evicted first.
pub struct MemoryCache {
    ttl: Option<Duration>,
    max_entries: usize,
    inner: Mutex<MemoryInner>,
}

impl MemoryCache {
    pub fn new(ttl: Option<Duration>, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn load(&self, key: &str) -> Option<StoredResponse> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires.is_some_and(|at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        inner.entries.get(key).map(|entry| entry.response.clone())
    }

    async fn store(&self, key: &str, entry: StoredResponse, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.entries.contains_key(key) {
            inner.order.retain(|k| k != key);
        }
        inner.order.push_back(key.to_string());
        inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                response: entry,
                expires: ttl.map(|ttl| Instant::now() + ttl),
            },
        );

        while inner.entries.len() > self.max_entries {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn expiration(&self) -> Option<Duration> {
        self.ttl
    }
}

/// Cacheability override. `Some` wins over the default script pattern.
pub type CacheableOverride = Arc<dyn Fn(&str) -> Option<bool> + Send + Sync>;

/// Wraps fetches with cache lookups and explicit [`CacheTag`]s.
#[derive(Clone, Default)]
pub struct CacheCoordinator {
    backend: Option<Arc<dyn CacheBackend>>,
    cacheable_override: Option<CacheableOverride>,
}

impl CacheCoordinator {
    pub fn new(backend: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            backend,
            cacheable_override: None,
        }
    }

    pub fn with_cacheable_override<F>(mut self, decide: F) -> Self
    where
        F: Fn(&str) -> Option<bool> + Send + Sync + 'static,
    {
        self.cacheable_override = Some(Arc::new(decide));
        self
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Whether results for `url` go through the backend. The override, when
    /// it returns a decision, wins over the default of script URLs only.
    pub fn is_cacheable(&self, url: &str) -> bool {
        if let Some(decide) = &self.cacheable_override {
            if let Some(decision) = decide(url) {
                return decision;
            }
        }
        is_script_url(url)
    }

    /// Coordinates one fetch of `url`.
    ///
    /// `fetch` is only invoked on a cache miss. The returned operation stays
    /// abortable through every stage: aborting it drops both a pending cache
    /// lookup and the network fetch.
    ///
    /// # Arguments
    ///
    /// * `url` - The resource URL, also used as the cache key
    /// * `fetch` - Starts the network fetch when the backend has no entry
    ///
    /// # Returns
    ///
    /// The response tagged [`CacheTag::Retrieved`] on a hit,
    /// [`CacheTag::JustStored`] after a miss, or [`CacheTag::Bypassed`] when
    /// there is no backend or `url` is not cacheable. Aborting resolves to
    /// [`FetchError::Aborted`].
    ///
    /// # Example
    ///
    /// ```
    /// use rendergate_common::AbortableOperation;
    /// use rendergate_fetch::{CacheCoordinator, CacheTag, FetchedResponse};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let coordinator = CacheCoordinator::default();
    /// let fetched = coordinator
    ///     .wrap("https://cdn.test/app.js", || {
    ///         AbortableOperation::ready(Ok(FetchedResponse {
    ///             url: "https://cdn.test/app.js".into(),
    ///             status: 200,
    ///             headers: Default::default(),
    ///             body: "run()".into(),
    ///         }))
    ///     })
    ///     .await
    ///     .unwrap();
    /// assert_eq!(fetched.tag, CacheTag::Bypassed);
    /// # }
    /// ```
    pub fn wrap<F>(
        &self,
        url: &str,
        fetch: F,
    ) -> AbortableOperation<Result<CachedFetch, FetchError>>
    where
        F: FnOnce() -> AbortableOperation<Result<FetchedResponse, FetchError>> + Send + 'static,
    {
        let backend = match &self.backend {
            Some(backend) if self.is_cacheable(url) => backend.clone(),
            _ => {
                return fetch().map(|result| {
                    result.map(|response| CachedFetch {
                        response,
                        tag: CacheTag::Bypassed,
                    })
                });
            }
        };

        let key = url.to_string();
        AbortableOperation::new(
            async move {
                if let Some(stored) = backend.load(&key).await {
                    tracing::debug!(url = %key, "Cache hit");
                    return Ok(CachedFetch {
                        response: stored.into(),
                        tag: CacheTag::Retrieved,
                    });
                }

                let response = fetch().await?;
                let entry = backend.prune(&response);
                backend.store(&key, entry, backend.expiration()).await;
                Ok(CachedFetch {
                    response,
                    tag: CacheTag::JustStored,
                })
            },
            || Err(FetchError::Aborted),
        )
    }
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("backend", &self.backend.is_some())
            .field("cacheable_override", &self.cacheable_override.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(url: &str, body: &'static str) -> FetchedResponse {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/javascript".to_string());
        headers.insert("Set-Cookie".to_string(), "session=1".to_string());
        FetchedResponse {
            url: url.to_string(),
            status: 200,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn counting_fetch(
        counter: Arc<AtomicUsize>,
        url: &'static str,
    ) -> impl FnOnce() -> AbortableOperation<Result<FetchedResponse, FetchError>> + Send + 'static
    {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            AbortableOperation::ready(Ok(response(url, "payload")))
        }
    }

    #[test]
    fn test_default_cacheability() {
        let coordinator = CacheCoordinator::default();
        assert!(coordinator.is_cacheable("https://x/a.js"));
        assert!(coordinator.is_cacheable("https://x/a.js?v=3"));
        assert!(!coordinator.is_cacheable("https://x/a.png"));
        assert!(!coordinator.is_cacheable("https://x/a.json"));
        assert!(!coordinator.is_cacheable("https://x/a.js/other"));
    }

    #[test]
    fn test_override_wins() {
        let coordinator = CacheCoordinator::default().with_cacheable_override(|url| {
            if url.ends_with(".png") {
                Some(true)
            } else if url.contains("nocache") {
                Some(false)
            } else {
                None
            }
        });
        assert!(coordinator.is_cacheable("https://x/a.png"));
        assert!(!coordinator.is_cacheable("https://x/nocache/a.js"));
        assert!(coordinator.is_cacheable("https://x/a.js"));
    }

    #[tokio::test]
    async fn test_without_backend_every_result_is_bypassed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let coordinator = CacheCoordinator::new(None);

        for _ in 0..2 {
            let fetched = coordinator
                .wrap("https://x/a.js", counting_fetch(counter.clone(), "https://x/a.js"))
                .await
                .unwrap();
            assert_eq!(fetched.tag, CacheTag::Bypassed);
            assert!(!fetched.tag.from_cache());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_then_retrieve_tags() {
        let counter = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(MemoryCache::new(None, 16));
        let coordinator = CacheCoordinator::new(Some(backend.clone()));

        let first = coordinator
            .wrap("https://x/a.js", counting_fetch(counter.clone(), "https://x/a.js"))
            .await
            .unwrap();
        assert_eq!(first.tag, CacheTag::JustStored);
        assert!(!first.tag.from_cache());

        let second = coordinator
            .wrap("https://x/a.js", counting_fetch(counter.clone(), "https://x/a.js"))
            .await
            .unwrap();
        assert_eq!(second.tag, CacheTag::Retrieved);
        assert!(second.tag.from_cache());
        assert_eq!(second.response.body, Bytes::from_static(b"payload"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_url_skips_backend() {
        let counter = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(MemoryCache::new(None, 16));
        let coordinator = CacheCoordinator::new(Some(backend.clone()));

        let fetched = coordinator
            .wrap("https://x/logo.png", counting_fetch(counter.clone(), "https://x/logo.png"))
            .await
            .unwrap();
        assert_eq!(fetched.tag, CacheTag::Bypassed);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_wrap_preserves_abort() {
        let backend = Arc::new(MemoryCache::new(None, 16));
        let coordinator = CacheCoordinator::new(Some(backend.clone()));
        let op = coordinator.wrap("https://x/slow.js", || {
            AbortableOperation::new(std::future::pending(), || Err(FetchError::Aborted))
        });
        op.abort();
        assert!(matches!(op.await, Err(FetchError::Aborted)));
        assert!(backend.is_empty());

        let passthrough = CacheCoordinator::new(None).wrap("https://x/slow.js", || {
            AbortableOperation::new(std::future::pending(), || Err(FetchError::Aborted))
        });
        passthrough.abort();
        assert!(matches!(passthrough.await, Err(FetchError::Aborted)));
    }

    #[test]
    fn test_prune_keeps_selected_headers_and_round_trips() {
        let backend = MemoryCache::new(None, 1);
        let original = response("https://x/a.js", "body");
        let stored = backend.prune(&original);

        assert_eq!(stored.headers.len(), 1);
        assert_eq!(
            stored.headers.get("content-type").map(String::as_str),
            Some("application/javascript")
        );

        let json = serde_json::to_string(&stored).unwrap();
        let decoded: StoredResponse = serde_json::from_str(&json).unwrap();
        let restored: FetchedResponse = decoded.into();
        assert_eq!(restored.body, original.body);
        assert_eq!(restored.status, 200);
        assert_eq!(restored.header("Content-Type"), Some("application/javascript"));
    }

    #[tokio::test]
    async fn test_memory_cache_evicts_oldest_and_expires() {
        let cache = MemoryCache::new(None, 2);
        let entry = |url: &str| cache.prune(&response(url, "x"));

        cache.store("a", entry("a"), None).await;
        cache.store("b", entry("b"), None).await;
        cache.store("c", entry("c"), None).await;
        assert_eq!(cache.len(), 2);
        assert!(cache.load("a").await.is_none());
        assert!(cache.load("c").await.is_some());

        cache.store("short", entry("short"), Some(Duration::from_millis(0))).await;
        assert!(cache.load("short").await.is_none());
    }
}
