use rendergate_common::RenderError;
use std::io;
use thiserror::Error;

/// Low-level network failure classes, mirroring socket error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorCode {
    Reset,
    Refused,
    TimedOut,
    BrokenPipe,
    AddrInUse,
    NotFound,
    ConnectFailed,
    Other,
}

impl NetworkErrorCode {
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => NetworkErrorCode::Reset,
            io::ErrorKind::ConnectionRefused => NetworkErrorCode::Refused,
            io::ErrorKind::TimedOut => NetworkErrorCode::TimedOut,
            io::ErrorKind::BrokenPipe => NetworkErrorCode::BrokenPipe,
            io::ErrorKind::AddrInUse => NetworkErrorCode::AddrInUse,
            io::ErrorKind::NotFound => NetworkErrorCode::NotFound,
            io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => {
                NetworkErrorCode::ConnectFailed
            }
            _ => NetworkErrorCode::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkErrorCode::Reset => "ECONNRESET",
            NetworkErrorCode::Refused => "ECONNREFUSED",
            NetworkErrorCode::TimedOut => "ETIMEDOUT",
            NetworkErrorCode::BrokenPipe => "EPIPE",
            NetworkErrorCode::AddrInUse => "EADDRINUSE",
            NetworkErrorCode::NotFound => "ENOTFOUND",
            NetworkErrorCode::ConnectFailed => "ECONNECT",
            NetworkErrorCode::Other => "EOTHER",
        }
    }
}

impl std::fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Network error ({code}): {message}")]
    Network { code: NetworkErrorCode, message: String },

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection agent for '{0}' has been destroyed")]
    AgentDestroyed(String),

    #[error("Fetch aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Path '{0}' resolves outside the loader root")]
    OutsideRoot(String),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Default retry classification: connection-level failures, timeouts and
    /// 5xx responses other than 501.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { code, .. } => *code != NetworkErrorCode::Other,
            FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => (500..600).contains(status) && *status != 501,
            FetchError::Exhausted { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Finds the first `io::Error` in an error's source chain.
fn io_kind(err: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        current = e.source();
    }
    None
}

fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout(0);
        }

        let message = describe(&err);
        if let Some(kind) = io_kind(&err) {
            let code = NetworkErrorCode::from_io_kind(kind);
            if code != NetworkErrorCode::Other {
                return FetchError::Network { code, message };
            }
        }

        if err.is_connect() {
            let code = if message.contains("dns error") || message.contains("failed to lookup") {
                NetworkErrorCode::NotFound
            } else {
                NetworkErrorCode::ConnectFailed
            };
            return FetchError::Network { code, message };
        }
        if err.is_builder() {
            return FetchError::InvalidUrl(message);
        }
        if err.is_body() || err.is_decode() {
            return FetchError::Body(message);
        }
        FetchError::Network {
            code: NetworkErrorCode::Other,
            message,
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidUrl(err.to_string())
    }
}

impl From<FetchError> for RenderError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Exhausted { attempts, source } => RenderError::TransientUpstream {
                attempts,
                message: source.to_string(),
            },
            FetchError::Aborted => RenderError::Cancelled,
            other => RenderError::Retrieval(other.to_string()),
        }
    }
}
