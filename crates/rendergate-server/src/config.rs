//! Gateway configuration.
//!
//! Loaded from a TOML file; every field has a default, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! registration_name = "registerRender"
//! route = "/render"
//! execution_timeout_ms = 30000
//! script_base = "https://cdn.example.com/app/"
//! scripts = ["vendor.js", "app.js"]
//!
//! [fetch]
//! retries = 2
//! timeout_ms = 60000
//!
//! [cache]
//! enabled = true
//! ttl_secs = 300
//!
//! [loader]
//! kind = "http"
//!
//! [limits]
//! loop_iterations = 10000000
//! recursion = 512
//!
//! [globals]
//! release = "2024.06"
//! ```

use rendergate_common::{RenderError, Result};
use rendergate_fetch::{
    AgentConfig, CacheCoordinator, FetchOptions, FileLoaderFactory, HttpLoaderFactory,
    LoaderFactory, MemoryCache,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::resolver::StaticFileList;
use crate::runtime::SandboxLimits;

/// Longest execution timeout accepted.
const MAX_EXECUTION_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Global function the program calls to register its render callback
    pub registration_name: String,
    /// HTTP path serving renders
    pub route: String,
    pub execution_timeout_ms: u64,
    /// Program files executed for every render, in order
    pub scripts: Vec<String>,
    /// Base URL for relative `scripts` entries
    pub script_base: Option<String>,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    pub limits: LimitsConfig,
    /// Values installed as sandbox globals before the program files run
    pub globals: BTreeMap<String, toml::Value>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            registration_name: "registerRender".to_string(),
            route: "/render".to_string(),
            execution_timeout_ms: 30_000,
            scripts: Vec::new(),
            script_base: None,
            fetch: FetchConfig::default(),
            cache: CacheConfig::default(),
            loader: LoaderConfig::default(),
            limits: LimitsConfig::default(),
            globals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub retries: u32,
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub user_agent: Option<String>,
    pub pool_idle_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let options = FetchOptions::default();
        let agent = AgentConfig::default();
        Self {
            retries: options.retries,
            timeout_ms: options.timeout.as_millis() as u64,
            initial_backoff_ms: options.initial_backoff.as_millis() as u64,
            max_backoff_ms: options.max_backoff.as_millis() as u64,
            backoff_multiplier: options.backoff_multiplier,
            user_agent: None,
            pool_idle_timeout_ms: agent.idle_timeout.as_millis() as u64,
            pool_max_idle_per_host: agent.max_idle_per_host,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: Option<u64>,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: None,
            max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    #[default]
    Http,
    Fs,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub kind: LoaderKind,
    /// Directory served by the `fs` loader
    pub root: Option<PathBuf>,
}

/// Script engine bounds for synchronous work, which the execution timeout
/// cannot interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub loop_iterations: u64,
    pub recursion: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Self {
            loop_iterations: limits.loop_iterations,
            recursion: limits.recursion,
        }
    }
}

impl RenderConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Arguments
    ///
    /// * `source` - TOML text; missing keys take their defaults
    ///
    /// # Returns
    ///
    /// The configuration, or [`RenderError::Config`] naming the first
    /// unparsable or invalid value.
    ///
    /// # Example
    ///
    /// ```
    /// use rendergate_server::RenderConfig;
    ///
    /// let config = RenderConfig::from_toml_str("route = \"/ssr\"").unwrap();
    /// assert_eq!(config.route, "/ssr");
    /// assert!(RenderConfig::from_toml_str("route = \"ssr\"").is_err());
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RenderConfig = toml::from_str(source)
            .map_err(|e| RenderError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            RenderError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            loop_iterations: self.limits.loop_iterations,
            recursion: self.limits.recursion,
        }
    }

    /// Checks values serde cannot: ranges, URLs and loader requirements.
    pub fn validate(&self) -> Result<()> {
        let timeout = self.execution_timeout();
        if timeout.is_zero() {
            return Err(RenderError::Config(
                "execution timeout must be greater than zero".to_string(),
            ));
        }
        if timeout > MAX_EXECUTION_TIMEOUT {
            return Err(RenderError::Config(format!(
                "execution timeout must be <= 1 hour (got {} seconds)",
                timeout.as_secs()
            )));
        }

        if !is_identifier(&self.registration_name) {
            return Err(RenderError::Config(format!(
                "registration name '{}' is not a valid JavaScript identifier",
                self.registration_name
            )));
        }
        if !self.route.starts_with('/') {
            return Err(RenderError::Config(format!(
                "route '{}' must start with '/'",
                self.route
            )));
        }

        if self.fetch.timeout_ms == 0 {
            return Err(RenderError::Config("fetch timeout must be greater than zero".to_string()));
        }
        if self.fetch.backoff_multiplier.is_nan() || self.fetch.backoff_multiplier < 1.0 {
            return Err(RenderError::Config(format!(
                "backoff multiplier must be >= 1.0 (got {})",
                self.fetch.backoff_multiplier
            )));
        }
        if self.fetch.initial_backoff_ms > self.fetch.max_backoff_ms {
            return Err(RenderError::Config(
                "initial backoff must not exceed max backoff".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(RenderError::Config(
                "cache max_entries must be greater than zero".to_string(),
            ));
        }

        if self.limits.loop_iterations == 0 || self.limits.recursion == 0 {
            return Err(RenderError::Config(
                "engine limits must be greater than zero".to_string(),
            ));
        }

        if self.loader.kind == LoaderKind::Fs {
            match &self.loader.root {
                None => return Err(RenderError::Config("fs loader requires 'root'".to_string())),
                Some(root) if !root.is_dir() => {
                    return Err(RenderError::Config(format!(
                        "fs loader root '{}' is not a directory",
                        root.display()
                    )));
                }
                Some(_) => {}
            }
        }

        self.script_base()?;
        Ok(())
    }

    pub fn script_base(&self) -> Result<Option<Url>> {
        self.script_base
            .as_deref()
            .map(|base| {
                Url::parse(base).map_err(|e| {
                    RenderError::Config(format!("Invalid script_base '{}': {}", base, e))
                })
            })
            .transpose()
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            retries: self.fetch.retries,
            timeout: Duration::from_millis(self.fetch.timeout_ms),
            initial_backoff: Duration::from_millis(self.fetch.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.fetch.max_backoff_ms),
            backoff_multiplier: self.fetch.backoff_multiplier,
            should_retry: None,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut agent = AgentConfig {
            idle_timeout: Duration::from_millis(self.fetch.pool_idle_timeout_ms),
            max_idle_per_host: self.fetch.pool_max_idle_per_host,
            ..AgentConfig::default()
        };
        if let Some(user_agent) = &self.fetch.user_agent {
            agent.user_agent = user_agent.clone();
        }
        agent
    }

    /// A coordinator over a fresh process-wide [`MemoryCache`], or one
    /// without a backend when caching is disabled.
    pub fn cache_coordinator(&self) -> CacheCoordinator {
        if !self.cache.enabled {
            return CacheCoordinator::default();
        }
        let backend = MemoryCache::new(
            self.cache.ttl_secs.map(Duration::from_secs),
            self.cache.max_entries,
        );
        CacheCoordinator::new(Some(Arc::new(backend)))
    }

    pub fn loader_factory(&self) -> Result<Arc<dyn LoaderFactory>> {
        match self.loader.kind {
            LoaderKind::Http => Ok(Arc::new(HttpLoaderFactory::new(
                self.fetch_options(),
                self.agent_config(),
                self.cache_coordinator(),
            ))),
            LoaderKind::Fs => {
                let root = self
                    .loader
                    .root
                    .clone()
                    .ok_or_else(|| RenderError::Config("fs loader requires 'root'".to_string()))?;
                Ok(Arc::new(FileLoaderFactory::new(root)))
            }
        }
    }

    pub fn file_list(&self) -> Result<StaticFileList> {
        StaticFileList::new(self.scripts.clone(), self.script_base()?.as_ref())
    }

    /// The `[globals]` table as JSON values.
    pub fn globals_json(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        self.globals
            .iter()
            .map(|(name, value)| Ok((name.clone(), serde_json::to_value(value)?)))
            .collect()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
