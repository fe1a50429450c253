//! HTTP fetch integration tests
//!
//! Runs the HTTP resource loader against a local hyper server:
//! 1. Plain script fetch
//! 2. Retry on 503 until success, with the retry counter
//! 3. No retry on 501 / 404
//! 4. Per-attempt timeout
//! 5. Cache coordination across loaders sharing a backend
//! 6. Abort and close while a request is in flight

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rendergate_common::Closeable;
use rendergate_fetch::{
    AgentConfig, CacheCoordinator, FetchError, FetchOptions, HttpResourceLoader, MemoryCache,
    ResourceLoader,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Clone, Default)]
struct Hits(Arc<Mutex<HashMap<String, usize>>>);

impl Hits {
    fn record(&self, path: &str) -> usize {
        let mut hits = self.0.lock().unwrap();
        let count = hits.entry(path.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn get(&self, path: &str) -> usize {
        self.0.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn respond(hits: Hits, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let count = hits.record(&path);

    let (status, body) = match path.as_str() {
        "/a.js" => (200, "window.a = 1;"),
        // Fails twice, then succeeds
        "/flaky.js" if count <= 2 => (503, "unavailable"),
        "/flaky.js" => (200, "window.flaky = true;"),
        "/unimplemented.js" => (501, "nope"),
        "/missing.js" => (404, "not found"),
        "/slow.js" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (200, "late")
        }
        _ => (404, "not found"),
    };

    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/javascript")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap())
}

/// Starts a test server on an ephemeral port.
async fn start_server() -> (SocketAddr, Hits) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Hits::default();
    let server_hits = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let hits = server_hits.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| respond(hits.clone(), req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

fn fast_options() -> FetchOptions {
    FetchOptions {
        retries: 2,
        timeout: Duration::from_secs(5),
        initial_backoff: Duration::from_millis(5),
        ..Default::default()
    }
}

fn loader(options: FetchOptions, cache: CacheCoordinator) -> HttpResourceLoader {
    HttpResourceLoader::new(options, AgentConfig::default(), cache)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_fetches_script() {
    let (addr, hits) = start_server().await;
    let loader = loader(fast_options(), CacheCoordinator::default());

    let body = loader.fetch(&format!("http://{}/a.js", addr)).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"window.a = 1;"));
    assert_eq!(hits.get("/a.js"), 1);
    assert_eq!(loader.agent_count(), 1);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn test_retries_503_until_success() {
    let (addr, hits) = start_server().await;
    let loader = loader(fast_options(), CacheCoordinator::default());

    let body = loader.fetch(&format!("http://{}/flaky.js", addr)).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"window.flaky = true;"));
    assert_eq!(hits.get("/flaky.js"), 3);
    assert_eq!(loader.retry_count(), 2);
}

#[tokio::test]
async fn test_retry_budget_exhaustion() {
    let (addr, hits) = start_server().await;
    let options = FetchOptions {
        retries: 1,
        ..fast_options()
    };
    let loader = loader(options, CacheCoordinator::default());

    let result = loader.fetch(&format!("http://{}/flaky.js", addr)).await;
    match result {
        Err(FetchError::Exhausted { attempts, source }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, FetchError::Status { status: 503, .. }));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(hits.get("/flaky.js"), 2);
}

#[tokio::test]
async fn test_501_and_404_are_not_retried() {
    let (addr, hits) = start_server().await;
    let loader = loader(fast_options(), CacheCoordinator::default());

    let result = loader.fetch(&format!("http://{}/unimplemented.js", addr)).await;
    assert!(matches!(result, Err(FetchError::Status { status: 501, .. })));
    assert_eq!(hits.get("/unimplemented.js"), 1);

    let result = loader.fetch(&format!("http://{}/missing.js", addr)).await;
    assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
    assert_eq!(hits.get("/missing.js"), 1);
    assert_eq!(loader.retry_count(), 0);
}

#[tokio::test]
async fn test_retry_override_disables_retries() {
    let (addr, hits) = start_server().await;
    let options = fast_options().with_retry_override(|_, _| Some(false));
    let loader = loader(options, CacheCoordinator::default());

    let result = loader.fetch(&format!("http://{}/flaky.js", addr)).await;
    assert!(result.is_err());
    assert_eq!(hits.get("/flaky.js"), 1);
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let (addr, hits) = start_server().await;
    let options = FetchOptions {
        retries: 1,
        timeout: Duration::from_millis(100),
        initial_backoff: Duration::from_millis(1),
        ..Default::default()
    };
    let loader = loader(options, CacheCoordinator::default());

    let result = loader.fetch(&format!("http://{}/slow.js", addr)).await;
    match result {
        Err(FetchError::Exhausted { attempts, source }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, FetchError::Timeout(100)));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(hits.get("/slow.js"), 2);
}

#[tokio::test]
async fn test_shared_cache_serves_second_loader() {
    let (addr, hits) = start_server().await;
    let backend = Arc::new(MemoryCache::new(None, 64));
    let cache = CacheCoordinator::new(Some(backend.clone()));
    let url = format!("http://{}/a.js", addr);

    let first = loader(fast_options(), cache.clone());
    assert_eq!(first.fetch(&url).await.unwrap(), Bytes::from_static(b"window.a = 1;"));
    first.close().unwrap();

    let second = loader(fast_options(), cache);
    assert_eq!(second.fetch(&url).await.unwrap(), Bytes::from_static(b"window.a = 1;"));

    assert_eq!(hits.get("/a.js"), 1);
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn test_close_during_fetch_yields_empty_bytes() {
    let (addr, _hits) = start_server().await;
    let loader = Arc::new(loader(fast_options(), CacheCoordinator::default()));

    let op = loader.fetch(&format!("http://{}/slow.js", addr));
    let task = tokio::spawn(op);
    tokio::time::sleep(Duration::from_millis(50)).await;

    loader.close().unwrap();
    assert!(!loader.is_active());
    assert_eq!(loader.agent_count(), 0);

    let body = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("close should abort the in-flight fetch")
        .unwrap()
        .unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_abort_single_fetch() {
    let (addr, _hits) = start_server().await;
    let loader = loader(fast_options(), CacheCoordinator::default());

    let op = loader.fetch(&format!("http://{}/slow.js", addr));
    op.abort();
    assert!(op.await.unwrap().is_empty());
    assert!(loader.is_active());
    assert_eq!(loader.in_flight(), 0);
}
