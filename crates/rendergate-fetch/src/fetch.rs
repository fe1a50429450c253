//! Retrying GET fetches
//!
//! [`FetchLayer::fetch`] turns a URL into an [`AbortableOperation`] that
//! performs the request on a [`ConnectionAgent`], enforcing a per-attempt
//! timeout and retrying failed attempts with exponential backoff.
//!
//! # Retry Logic
//!
//! After a failed attempt the layer asks, in order:
//! 1. the injected override (`FetchOptions::should_retry`), if it returns `Some`
//! 2. the default policy, [`FetchError::is_transient`]
//!
//! Waits start at `initial_backoff` and grow by `backoff_multiplier`, capped at
//! `max_backoff`. A transient failure that survives the whole budget is
//! reported as [`FetchError::Exhausted`].

use crate::agent::ConnectionAgent;
use crate::error::FetchError;
use bytes::Bytes;
use rendergate_common::AbortableOperation;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Retry override. Receives the failure and the 1-based retry number that
/// would follow; `None` defers to the default policy.
pub type RetryOverride = Arc<dyn Fn(&FetchError, u32) -> Option<bool> + Send + Sync>;

/// Options for a single fetch.
///
/// # Default Configuration
///
/// - `retries`: 2
/// - `timeout`: 60 seconds per attempt
/// - `initial_backoff`: 50ms, `max_backoff`: 5s, `backoff_multiplier`: 2.0
#[derive(Clone)]
pub struct FetchOptions {
    /// Retries after the first attempt
    pub retries: u32,
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub should_retry: Option<RetryOverride>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            timeout: Duration::from_millis(60_000),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(5_000),
            backoff_multiplier: 2.0,
            should_retry: None,
        }
    }
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl FetchOptions {
    pub fn with_retry_override<F>(mut self, decide: F) -> Self
    where
        F: Fn(&FetchError, u32) -> Option<bool> + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(decide));
        self
    }

    /// Whether the failure should be followed by retry number `retry`.
    pub fn decide_retry(&self, error: &FetchError, retry: u32) -> bool {
        if let Some(decide) = &self.should_retry {
            if let Some(decision) = decide(error, retry) {
                return decision;
            }
        }
        error.is_transient()
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(next.max(0.0)).min(self.max_backoff)
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl FetchedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Fetch executor with a request-scoped retry counter.
#[derive(Debug, Clone, Default)]
pub struct FetchLayer {
    options: FetchOptions,
    retries: Arc<AtomicU64>,
}

impl FetchLayer {
    pub fn new(options: FetchOptions) -> Self {
        Self {
            options,
            retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Retries performed by every fetch started from this layer.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Starts a fetch of `url` over `agent`. Aborting resolves the operation
    /// to [`FetchError::Aborted`] and drops the in-flight request.
    pub fn fetch(
        &self,
        url: &str,
        agent: Arc<ConnectionAgent>,
    ) -> AbortableOperation<Result<FetchedResponse, FetchError>> {
        let layer = self.clone();
        let url = url.to_string();
        AbortableOperation::new(
            async move { layer.fetch_with_retry(&url, &agent).await },
            || Err(FetchError::Aborted),
        )
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        agent: &ConnectionAgent,
    ) -> Result<FetchedResponse, FetchError> {
        let mut backoff = self.options.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            let error = match self.fetch_once(url, agent).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt < self.options.retries && self.options.decide_retry(&error, attempt + 1) {
                self.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Fetch of {} failed (attempt {}): {}, retrying in {}ms",
                    url,
                    attempt + 1,
                    error,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
                backoff = self.options.next_backoff(backoff);
                attempt += 1;
                continue;
            }

            if error.is_transient() {
                return Err(FetchError::Exhausted {
                    attempts: attempt + 1,
                    source: Box::new(error),
                });
            }
            return Err(error);
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        agent: &ConnectionAgent,
    ) -> Result<FetchedResponse, FetchError> {
        let client = agent.client()?;
        let timeout_ms = self.options.timeout.as_millis() as u64;
        let with_timeout = |e: reqwest::Error| match FetchError::from(e) {
            FetchError::Timeout(_) => FetchError::Timeout(timeout_ms),
            other => other,
        };

        let request = async {
            let response = client.get(url).send().await.map_err(with_timeout)?;
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.bytes().await.map_err(with_timeout)?;

            Ok::<_, FetchError>(FetchedResponse {
                url: final_url,
                status,
                headers,
                body,
            })
        };

        let response = tokio::time::timeout(self.options.timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout_ms))??;

        if !(200..300).contains(&response.status) {
            return Err(FetchError::Status {
                status: response.status,
                url: url.to_string(),
            });
        }

        tracing::debug!(url, status = response.status, bytes = response.body.len(), "Fetched");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorCode;

    #[test]
    fn test_default_options() {
        let options = FetchOptions::default();
        assert_eq!(options.retries, 2);
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert!(options.should_retry.is_none());
    }

    #[test]
    fn test_override_wins_over_default_policy() {
        let reset = FetchError::Network {
            code: NetworkErrorCode::Reset,
            message: "reset".into(),
        };
        let not_found = FetchError::Status { status: 404, url: "u".into() };

        let never = FetchOptions::default().with_retry_override(|_, _| Some(false));
        assert!(!never.decide_retry(&reset, 1));

        let always = FetchOptions::default().with_retry_override(|_, _| Some(true));
        assert!(always.decide_retry(&not_found, 1));

        let defer = FetchOptions::default().with_retry_override(|_, _| None);
        assert!(defer.decide_retry(&reset, 1));
        assert!(!defer.decide_retry(&not_found, 1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let options = FetchOptions {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(120),
            ..Default::default()
        };
        let second = options.next_backoff(options.initial_backoff);
        assert_eq!(second, Duration::from_millis(100));
        assert_eq!(options.next_backoff(second), Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_destroyed_agent_fails_without_retry() {
        let agent = Arc::new(ConnectionAgent::new("http", &Default::default()).unwrap());
        agent.destroy();

        let layer = FetchLayer::new(FetchOptions::default());
        let result = layer.fetch("http://127.0.0.1:9/a.js", agent).await;
        assert!(matches!(result, Err(FetchError::AgentDestroyed(_))));
        assert_eq!(layer.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_is_retried_then_exhausted() {
        // Bind then drop a listener so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let agent = Arc::new(ConnectionAgent::new("http", &Default::default()).unwrap());
        let layer = FetchLayer::new(FetchOptions {
            retries: 2,
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        });

        let result = layer.fetch(&format!("http://127.0.0.1:{}/a.js", port), agent).await;
        match result {
            Err(FetchError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted retries, got {:?}", other),
        }
        assert_eq!(layer.retry_count(), 2);
    }
}
