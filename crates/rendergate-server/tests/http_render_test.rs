//! HTTP render integration tests
//!
//! Starts the full server on an ephemeral port with a file-system loader and
//! drives it with reqwest:
//! 1. Successful render with request headers visible to the sandbox
//! 2. Redirects, malformed results and input errors
//! 3. Health and unknown routes
//! 4. Custom error handlers, including one that fails

use async_trait::async_trait;
use rendergate_common::{RenderApi, RenderError, RenderResult};
use rendergate_server::{ErrorHandler, HttpServer, Orchestrator, RenderConfig, RenderRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

// ============================================================================
// Test Helpers
// ============================================================================

const APP_JS: &str = r#"
registerRender(function (api) {
    if (location.pathname === '/old') {
        return { body: '', status: 302, headers: { Location: '/new' } };
    }
    if (location.pathname === '/broken') {
        return { status: 200, headers: {} };
    }
    if (location.pathname === '/later') {
        return fetchResource('greeting.js').then(function (text) {
            return { body: text.trim(), status: 200, headers: {} };
        });
    }
    return {
        body: 'Hello ' + location.pathname + ' ' + (api.getHeader('x-locale') || 'none') + ' ' + release,
        status: 200,
        headers: { 'Content-Type': 'text/plain', 'X-Rendered-By': 'rendergate' }
    };
});
"#;

struct TestApp {
    _dir: TempDir,
    addr: SocketAddr,
    client: reqwest::Client,
}

impl TestApp {
    fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    async fn get(&self, path_and_query: &str) -> reqwest::Response {
        self.client.get(self.url(path_and_query)).send().await.unwrap()
    }
}

fn write_app() -> (TempDir, RenderConfig) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.js"), APP_JS).unwrap();
    std::fs::write(dir.path().join("greeting.js"), "fetched later\n").unwrap();

    let config = RenderConfig::from_toml_str(&format!(
        r#"
        scripts = ["app.js"]
        execution_timeout_ms = 5000

        [loader]
        kind = "fs"
        root = {:?}

        [globals]
        release = "r42"
        "#,
        dir.path().display().to_string()
    ))
    .unwrap();
    (dir, config)
}

async fn start_app(handler: Option<Arc<dyn ErrorHandler>>) -> TestApp {
    let (dir, config) = write_app();
    let orchestrator = Orchestrator::from_config(&config).unwrap();
    let mut router = RenderRouter::new(orchestrator, config.route.clone());
    if let Some(handler) = handler {
        router = router.with_error_handler(handler);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(HttpServer::new(router).serve(listener));

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    TestApp {
        _dir: dir,
        addr,
        client,
    }
}

fn render_path(url: &str) -> String {
    format!(
        "/render?url={}",
        url::form_urlencoded::byte_serialize(url.as_bytes()).collect::<String>()
    )
}

async fn error_json(response: reqwest::Response) -> serde_json::Value {
    assert_eq!(response.status(), 500);
    serde_json::from_str(&response.text().await.unwrap()).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_render_success() {
    let app = start_app(None).await;

    let response = app
        .client
        .get(app.url(&render_path("https://shop.test/welcome")))
        .header("X-Locale", "de")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rendered-by"], "rendergate");
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "Hello /welcome de r42");
}

#[tokio::test]
async fn test_async_render_with_fetch_resource() {
    let app = start_app(None).await;
    let response = app.get(&render_path("https://shop.test/later")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "fetched later");
}

#[tokio::test]
async fn test_redirect_passthrough() {
    let app = start_app(None).await;
    let response = app.get(&render_path("https://shop.test/old")).await;
    assert_eq!(response.status(), 302);
    assert_eq!(response.headers()["location"], "/new");
}

#[tokio::test]
async fn test_malformed_result_is_500() {
    let app = start_app(None).await;
    let body = error_json(app.get(&render_path("https://shop.test/broken")).await).await;
    assert_eq!(body["error"]["kind"], "malformed_result");
    assert_eq!(body["error"]["url"], "https://shop.test/broken");
}

#[tokio::test]
async fn test_url_parameter_must_appear_once() {
    let app = start_app(None).await;

    let body = error_json(app.get("/render").await).await;
    assert_eq!(body["error"]["kind"], "invalid_input");
    assert!(body["error"]["url"].is_null());

    let body = error_json(app.get("/render?url=https://a.test/&url=https://b.test/").await).await;
    assert_eq!(body["error"]["kind"], "invalid_input");
}

#[tokio::test]
async fn test_health_and_unknown_routes() {
    let app = start_app(None).await;

    let response = app.get("/healthz").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    let response = app.get("/elsewhere").await;
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["error"]["kind"], "not_found");
}

struct FriendlyPage;

#[async_trait]
impl ErrorHandler for FriendlyPage {
    async fn handle(
        &self,
        error: &RenderError,
        url: Option<&str>,
        _api: &dyn RenderApi,
    ) -> anyhow::Result<RenderResult> {
        Ok(RenderResult::new(500, format!("Sorry ({}) {}", error.kind(), url.unwrap_or("-")))
            .with_header("Content-Type", "text/html"))
    }
}

struct BrokenHandler;

#[async_trait]
impl ErrorHandler for BrokenHandler {
    async fn handle(
        &self,
        _error: &RenderError,
        _url: Option<&str>,
        _api: &dyn RenderApi,
    ) -> anyhow::Result<RenderResult> {
        anyhow::bail!("template store offline")
    }
}

#[tokio::test]
async fn test_custom_error_handler() {
    let app = start_app(Some(Arc::new(FriendlyPage))).await;
    let response = app.get(&render_path("https://shop.test/broken")).await;

    assert_eq!(response.status(), 500);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(
        response.text().await.unwrap(),
        "Sorry (malformed_result) https://shop.test/broken"
    );
}

#[tokio::test]
async fn test_failing_error_handler_reports_both_errors() {
    let app = start_app(Some(Arc::new(BrokenHandler))).await;
    let response = app.get(&render_path("https://shop.test/broken")).await;

    assert_eq!(response.status(), 500);
    let text = response.text().await.unwrap();
    assert!(text.contains("template store offline"), "{}", text);
    assert!(text.contains("Malformed render result"), "{}", text);
}
