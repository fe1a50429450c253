//! rendergate resource fetching
//!
//! Everything between a render and the network:
//!
//! - [`agent`] - per-scheme connection agents, owned by one loader
//! - [`fetch`] - retrying, timed GET fetches returning [`AbortableOperation`]s
//! - [`cache`] - cacheability decisions and the [`CacheBackend`] plugin contract
//! - [`loader`] - the [`ResourceLoader`] capability and its HTTP implementation
//! - [`fs_loader`] - a loader serving files beneath a root directory
//!
//! [`AbortableOperation`]: rendergate_common::AbortableOperation

pub mod agent;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod fs_loader;
pub mod loader;

pub use agent::{AgentConfig, AgentPool, ConnectionAgent};
pub use cache::{
    is_script_url, CacheBackend, CacheCoordinator, CacheTag, CachedFetch, MemoryCache,
    StoredResponse,
};
pub use error::{FetchError, NetworkErrorCode};
pub use fetch::{FetchLayer, FetchOptions, FetchedResponse, RetryOverride};
pub use fs_loader::FileResourceLoader;
pub use loader::{
    scripts_only, FileLoaderFactory, HttpLoaderFactory, HttpResourceLoader, LoadOperation,
    LoaderFactory, ResourceFilter, ResourceLoader,
};
