//! Per-scheme connection agents.
//!
//! An [`AgentPool`] belongs to exactly one resource loader. Agents are created
//! on first use for a scheme and keep their keep-alive connections until the
//! owning loader closes and calls [`AgentPool::destroy_all`]. Nothing in this
//! module is shared between renders.

use crate::error::FetchError;
use rendergate_common::CloseFlag;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Schemes an agent can be created for.
pub const SUPPORTED_SCHEMES: [&str; 2] = ["http", "https"];

/// Connection agent configuration.
///
/// # Default Configuration
///
/// - `idle_timeout`: 90 seconds
/// - `max_idle_per_host`: 32
/// - `user_agent`: `rendergate/<version>`
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How long an idle keep-alive connection is retained
    pub idle_timeout: Duration,
    /// Upper bound of idle connections kept per host
    pub max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 32,
            user_agent: concat!("rendergate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Reusable connection state for one scheme.
pub struct ConnectionAgent {
    scheme: String,
    client: RwLock<Option<reqwest::Client>>,
}

impl ConnectionAgent {
    pub fn new(scheme: &str, config: &AgentConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(FetchError::from)?;

        Ok(Self {
            scheme: scheme.to_string(),
            client: RwLock::new(Some(client)),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Client handle for one request. Fails once the agent is destroyed.
    pub fn client(&self) -> Result<reqwest::Client, FetchError> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| FetchError::AgentDestroyed(self.scheme.clone()))
    }

    /// Drops the agent's client and with it the idle connection pool.
    /// Returns `false` if the agent was already destroyed.
    pub fn destroy(&self) -> bool {
        self.client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl std::fmt::Debug for ConnectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAgent")
            .field("scheme", &self.scheme)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Lazily populated table of agents keyed by scheme.
pub struct AgentPool {
    config: AgentConfig,
    agents: Mutex<HashMap<String, Arc<ConnectionAgent>>>,
    destroyed: CloseFlag,
}

impl AgentPool {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
            destroyed: CloseFlag::new(),
        }
    }

    /// Returns the agent for `scheme`, creating it on first use.
    pub fn agent(&self, scheme: &str) -> Result<Arc<ConnectionAgent>, FetchError> {
        if self.destroyed.is_closed() {
            return Err(FetchError::AgentDestroyed(scheme.to_string()));
        }
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(FetchError::InvalidUrl(format!("unsupported scheme '{}'", scheme)));
        }

        let mut agents = self.agents.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(agent) = agents.get(scheme) {
            return Ok(agent.clone());
        }

        let agent = Arc::new(ConnectionAgent::new(scheme, &self.config)?);
        tracing::debug!(scheme, "Created connection agent");
        agents.insert(scheme.to_string(), agent.clone());
        Ok(agent)
    }

    /// Number of live agents.
    pub fn len(&self) -> usize {
        self.agents.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys every agent and clears the table. The pool refuses to create
    /// new agents afterwards. Returns the number of agents destroyed.
    pub fn destroy_all(&self) -> usize {
        self.destroyed.close();
        let drained: Vec<_> = self
            .agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();

        drained.iter().filter(|(_, agent)| agent.destroy()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agents_are_created_lazily_and_reused() {
        let pool = AgentPool::new(AgentConfig::default());
        assert!(pool.is_empty());

        let first = pool.agent("https").unwrap();
        let second = pool.agent("https").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);

        pool.agent("http").unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let pool = AgentPool::new(AgentConfig::default());
        assert!(matches!(pool.agent("ftp"), Err(FetchError::InvalidUrl(_))));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_destroy_all_releases_every_agent() {
        let pool = AgentPool::new(AgentConfig::default());
        let agent = pool.agent("http").unwrap();
        pool.agent("https").unwrap();

        assert_eq!(pool.destroy_all(), 2);
        assert!(pool.is_empty());
        assert!(agent.is_destroyed());
        assert!(matches!(agent.client(), Err(FetchError::AgentDestroyed(_))));

        // No agent may be created after the owner closed.
        assert!(matches!(pool.agent("http"), Err(FetchError::AgentDestroyed(_))));
        assert_eq!(pool.destroy_all(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let agent = ConnectionAgent::new("http", &AgentConfig::default()).unwrap();
        assert!(agent.client().is_ok());
        assert!(agent.destroy());
        assert!(!agent.destroy());
    }
}
