//! Render inputs and outputs shared by the orchestrator and its callers.

use crate::error::{RenderError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Status codes that must carry a `Location` header.
pub const REDIRECT_STATUSES: [u16; 4] = [301, 302, 307, 308];

/// A program file retrieved for a render. Execution order is list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub url: String,
    pub content: Bytes,
}

impl SourceFile {
    pub fn new(url: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
        }
    }

    /// Content as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// What the registered render callback produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    pub body: Bytes,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RenderResult {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header lookup ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        REDIRECT_STATUSES.contains(&self.status)
    }

    /// Rejects redirects without a `Location` header and statuses outside
    /// the HTTP range.
    pub fn validate(&self) -> Result<()> {
        if !(100..=999).contains(&self.status) {
            return Err(RenderError::MalformedResult(format!(
                "status {} is not a valid HTTP status code",
                self.status
            )));
        }
        if self.is_redirect() && self.header("location").is_none() {
            return Err(RenderError::MalformedResult(format!(
                "redirect status {} requires a Location header",
                self.status
            )));
        }
        Ok(())
    }
}

/// A named timing session opened by sandboxed code.
pub trait TraceSession: Send {
    fn add_label(&mut self, key: &str, value: &str);

    /// Ends the session. Later calls are ignored.
    fn end(&mut self);
}

/// Capabilities handed to the registered render callback.
pub trait RenderApi: Send + Sync {
    fn trace(&self, name: &str) -> Box<dyn TraceSession>;

    /// Inbound request header, matched case-insensitively.
    fn header(&self, name: &str) -> Option<String>;
}

/// [`RenderApi`] backed by the inbound request's headers.
#[derive(Debug, Clone, Default)]
pub struct RequestRenderApi {
    headers: BTreeMap<String, String>,
}

impl RequestRenderApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut api = Self::new();
        for (name, value) in headers {
            api.insert(name.as_ref(), value);
        }
        api
    }

    /// Adds a header. Repeated names keep the first value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }
}

impl RenderApi for RequestRenderApi {
    fn trace(&self, name: &str) -> Box<dyn TraceSession> {
        Box::new(TimedTraceSession::start(name))
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }
}

/// Trace session that reports its labels and elapsed time as a debug event.
#[derive(Debug)]
pub struct TimedTraceSession {
    name: String,
    labels: Vec<(String, String)>,
    started: Instant,
    ended: bool,
}

impl TimedTraceSession {
    pub fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: Vec::new(),
            started: Instant::now(),
            ended: false,
        }
    }

    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl TraceSession for TimedTraceSession {
    fn add_label(&mut self, key: &str, value: &str) {
        if !self.ended {
            self.labels.push((key.to_string(), value.to_string()));
        }
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        tracing::debug!(
            trace = %self.name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            labels = ?self.labels,
            "Trace session ended"
        );
    }
}

impl Drop for TimedTraceSession {
    fn drop(&mut self) {
        self.end();
    }
}
