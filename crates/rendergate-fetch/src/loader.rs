//! Resource loaders
//!
//! A [`ResourceLoader`] resolves URLs to bytes for exactly one render. It is
//! [`Closeable`]: closing it flips it inactive, aborts every fetch still in
//! flight and releases its connection agents. An inactive loader never
//! fails a fetch; it answers with empty bytes so callers that treat a missing
//! result as fatal keep working during teardown.

use crate::agent::{AgentConfig, AgentPool};
use crate::cache::{is_script_url, CacheCoordinator};
use crate::error::FetchError;
use crate::fetch::{FetchLayer, FetchOptions};
use crate::fs_loader::FileResourceLoader;
use bytes::Bytes;
use rendergate_common::{AbortHandle, AbortableOperation, CloseFlag, Closeable};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

/// Result of a loader fetch.
pub type LoadOperation = AbortableOperation<Result<Bytes, FetchError>>;

/// Decides whether a URL is worth fetching at all.
pub type ResourceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// The default filter: script files only.
pub fn scripts_only() -> ResourceFilter {
    Arc::new(is_script_url)
}

pub trait ResourceLoader: Closeable {
    /// Fetches `url`.
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL, or a path for loaders that accept one
    ///
    /// # Returns
    ///
    /// An abortable operation resolving to the body. Filtered URLs, fetches
    /// on an inactive loader and fetches aborted by `close()` resolve to empty
    /// bytes rather than an error.
    fn fetch(&self, url: &str) -> LoadOperation;

    fn is_active(&self) -> bool;

    /// The loader as a teardown entry.
    fn into_closeable(self: Arc<Self>) -> Arc<dyn Closeable>;
}

/// Creates one fresh loader per render.
pub trait LoaderFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn ResourceLoader>, FetchError>;
}

/// Activity flag and in-flight registry shared by every loader kind.
#[derive(Default)]
pub(crate) struct LoaderState {
    closed: CloseFlag,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
}

impl LoaderState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.closed.is_closed()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Early answer for inactive loaders and filtered URLs.
    pub(crate) fn short_circuit(&self, url: &str, filter: &ResourceFilter) -> Option<LoadOperation> {
        if !self.is_active() {
            if !url.starts_with("data:") {
                tracing::warn!(url, "Resource requested after loader was closed");
            }
            return Some(AbortableOperation::ready(Ok(Bytes::new())));
        }
        if !filter(url) {
            tracing::trace!(url, "Resource skipped by filter");
            return Some(AbortableOperation::ready(Ok(Bytes::new())));
        }
        None
    }

    /// Registers `op` so `close()` can abort it. Results that settle after
    /// close, and aborted fetches, resolve to empty bytes. The registration
    /// ends when the operation settles or is dropped unfinished.
    pub(crate) fn track(self: &Arc<Self>, op: LoadOperation) -> LoadOperation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, op.handle());

        let entry = InFlightEntry {
            state: self.clone(),
            id,
        };
        op.map(move |result| {
            let state = entry.state.clone();
            drop(entry);

            if !state.is_active() {
                return Ok(Bytes::new());
            }
            match result {
                Err(FetchError::Aborted) => Ok(Bytes::new()),
                other => other,
            }
        })
    }

    /// Returns `true` for the call that actually closed the loader.
    pub(crate) fn close(&self) -> bool {
        if !self.closed.close() {
            return false;
        }
        let handles: Vec<AbortHandle> = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty() {
            tracing::debug!(aborted = handles.len(), "Aborted in-flight fetches");
        }
        true
    }
}

/// One registration in [`LoaderState::in_flight`], removed on drop.
struct InFlightEntry {
    state: Arc<LoaderState>,
    id: u64,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.state
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Loader fetching over HTTP(S) with retries, caching and keep-alive agents.
pub struct HttpResourceLoader {
    state: Arc<LoaderState>,
    agents: AgentPool,
    fetcher: FetchLayer,
    cache: CacheCoordinator,
    filter: ResourceFilter,
}

impl HttpResourceLoader {
    pub fn new(options: FetchOptions, agent_config: AgentConfig, cache: CacheCoordinator) -> Self {
        Self {
            state: LoaderState::new(),
            agents: AgentPool::new(agent_config),
            fetcher: FetchLayer::new(options),
            cache,
            filter: scripts_only(),
        }
    }

    pub fn with_filter(mut self, filter: ResourceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Retries performed by this loader's fetches so far.
    pub fn retry_count(&self) -> u64 {
        self.fetcher.retry_count()
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }
}

impl ResourceLoader for HttpResourceLoader {
    fn fetch(&self, url: &str) -> LoadOperation {
        if let Some(done) = self.state.short_circuit(url, &self.filter) {
            return done;
        }

        let agent = match Url::parse(url)
            .map_err(FetchError::from)
            .and_then(|parsed| self.agents.agent(parsed.scheme()))
        {
            Ok(agent) => agent,
            Err(e) => return AbortableOperation::ready(Err(e)),
        };

        let fetcher = self.fetcher.clone();
        let target = url.to_string();
        let op = self
            .cache
            .wrap(url, move || fetcher.fetch(&target, agent))
            .map(|result| {
                result.map(|cached| {
                    tracing::debug!(
                        url = %cached.response.url,
                        from_cache = cached.tag.from_cache(),
                        "Resource loaded"
                    );
                    cached.response.body
                })
            });

        self.state.track(op)
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn into_closeable(self: Arc<Self>) -> Arc<dyn Closeable> {
        self
    }
}

impl Closeable for HttpResourceLoader {
    fn name(&self) -> &str {
        "resource-loader"
    }

    fn close(&self) -> rendergate_common::Result<()> {
        if self.state.close() {
            let destroyed = self.agents.destroy_all();
            tracing::debug!(
                agents = destroyed,
                retries = self.fetcher.retry_count(),
                "Resource loader closed"
            );
        }
        Ok(())
    }
}

/// Builds [`HttpResourceLoader`]s sharing one cache coordinator.
#[derive(Clone)]
pub struct HttpLoaderFactory {
    options: FetchOptions,
    agent_config: AgentConfig,
    cache: CacheCoordinator,
    filter: Option<ResourceFilter>,
}

impl HttpLoaderFactory {
    pub fn new(options: FetchOptions, agent_config: AgentConfig, cache: CacheCoordinator) -> Self {
        Self {
            options,
            agent_config,
            cache,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: ResourceFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl LoaderFactory for HttpLoaderFactory {
    fn create(&self) -> Result<Arc<dyn ResourceLoader>, FetchError> {
        let mut loader = HttpResourceLoader::new(
            self.options.clone(),
            self.agent_config.clone(),
            self.cache.clone(),
        );
        if let Some(filter) = &self.filter {
            loader = loader.with_filter(filter.clone());
        }
        Ok(Arc::new(loader))
    }
}

/// Builds [`FileResourceLoader`]s rooted at one directory.
#[derive(Clone)]
pub struct FileLoaderFactory {
    root: PathBuf,
    filter: Option<ResourceFilter>,
}

impl FileLoaderFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: ResourceFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl LoaderFactory for FileLoaderFactory {
    fn create(&self) -> Result<Arc<dyn ResourceLoader>, FetchError> {
        let mut loader = FileResourceLoader::new(&self.root)?;
        if let Some(filter) = &self.filter {
            loader = loader.with_filter(filter.clone());
        }
        Ok(Arc::new(loader))
    }
}
