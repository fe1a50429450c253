//! HTTP Router
//!
//! Maps inbound requests onto renders:
//!
//! - `GET {route}?url=<u>` renders `u`; the request's headers are visible to
//!   the sandbox through `getHeader`
//! - `GET /healthz` answers `200 ok`
//! - anything else is a JSON `404`
//!
//! A failed render always answers `500`. An optional [`ErrorHandler`] may
//! supply the response body instead; if the handler itself fails, both errors
//! are logged and a plain-text body describing them is returned.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use rendergate_common::{RenderApi, RenderError, RenderResult, RequestRenderApi, Result};
use serde_json::json;
use std::sync::Arc;

use crate::orchestrator::Orchestrator;

pub type HttpResponse = Response<Full<Bytes>>;

const HEALTH_PATH: &str = "/healthz";

/// Produces a custom response for a failed render.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        error: &RenderError,
        url: Option<&str>,
        api: &dyn RenderApi,
    ) -> anyhow::Result<RenderResult>;
}

pub struct RenderRouter {
    orchestrator: Orchestrator,
    route: String,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl RenderRouter {
    pub fn new(orchestrator: Orchestrator, route: impl Into<String>) -> Self {
        Self {
            orchestrator,
            route: route.into(),
            error_handler: None,
        }
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse {
        let (parts, _) = req.into_parts();
        let path = parts.uri.path();

        if path == HEALTH_PATH {
            return respond(StatusCode::OK, "text/plain; charset=utf-8", "ok");
        }
        if path != self.route {
            return json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                &format!("No route for {}", path),
                None,
            );
        }
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return json_error(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                &format!("{} is not supported on {}", parts.method, self.route),
                None,
            );
        }

        let mut api = RequestRenderApi::new();
        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                api.insert(name.as_str(), value);
            }
        }
        let api = Arc::new(api);

        let url = match render_target(parts.uri.query()) {
            Ok(url) => url,
            Err(e) => return self.error_response(e, None, api.as_ref()).await,
        };

        match self.orchestrator.render(&url, api.clone()).await {
            Ok(result) => to_response(result),
            Err(e) => self.error_response(e, Some(&url), api.as_ref()).await,
        }
    }

    async fn error_response(
        &self,
        error: RenderError,
        url: Option<&str>,
        api: &dyn RenderApi,
    ) -> HttpResponse {
        let handler = match &self.error_handler {
            Some(handler) => handler,
            None => {
                return json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error.kind(),
                    &error.to_string(),
                    url,
                )
            }
        };

        match handler.handle(&error, url, api).await {
            Ok(result) => {
                let mut response = to_response(result);
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
            Err(handler_error) => {
                let handler_error = handler_error.context(format!("while handling: {}", error));
                tracing::error!(
                    url = url.unwrap_or_default(),
                    error = ?handler_error,
                    "Error handler failed"
                );
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain; charset=utf-8",
                    format!("Internal Server Error\n\n{:#}", handler_error),
                )
            }
        }
    }
}

/// Extracts the single `url` query parameter.
pub fn render_target(query: Option<&str>) -> Result<String> {
    let mut urls: Vec<String> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .filter(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .collect();

    match urls.len() {
        1 => Ok(urls.remove(0)),
        0 => Err(RenderError::InvalidInput("missing 'url' query parameter".into())),
        n => Err(RenderError::InvalidInput(format!(
            "expected exactly one 'url' query parameter, found {}",
            n
        ))),
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_error(status: StatusCode, kind: &str, message: &str, url: Option<&str>) -> HttpResponse {
    let body = json!({
        "error": {
            "kind": kind,
            "message": message,
            "url": url,
        }
    });
    respond(status, "application/json", body.to_string())
}

/// Copies a render result onto an HTTP response. Headers that are not valid
/// HTTP are dropped with a warning.
fn to_response(result: RenderResult) -> HttpResponse {
    let mut response = Response::new(Full::new(result.body));
    *response.status_mut() =
        StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    for (name, value) in &result.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid response header"),
        }
    }
    response
}
