use thiserror::Error;

/// Errors surfaced by a render invocation.
///
/// Retrieval and fetch failures have already been through the retry policy by
/// the time they are wrapped here; everything else is terminal for the render.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("No render callback was registered via '{0}'")]
    NoRegistration(String),

    #[error("Malformed render result: {0}")]
    MalformedResult(String),

    #[error("Upstream unavailable after {attempts} attempt(s): {message}")]
    TransientUpstream { attempts: u32, message: String },

    #[error("JavaScript execution error: {0}")]
    ScriptExecution(String),

    #[error("Render timed out after {0}ms")]
    Timeout(u64),

    #[error("Render cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RenderError {
    /// Stable snake_case tag for logs and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::InvalidInput(_) => "invalid_input",
            RenderError::Retrieval(_) => "retrieval_error",
            RenderError::NoRegistration(_) => "no_registration",
            RenderError::MalformedResult(_) => "malformed_result",
            RenderError::TransientUpstream { .. } => "transient_upstream",
            RenderError::ScriptExecution(_) => "script_execution",
            RenderError::Timeout(_) => "timeout",
            RenderError::Cancelled => "cancelled",
            RenderError::Config(_) => "config",
            RenderError::Io(_) => "io",
            RenderError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Internal(format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(RenderError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(RenderError::NoRegistration("registerRender".into()).kind(), "no_registration");
        assert_eq!(
            RenderError::TransientUpstream { attempts: 3, message: "reset".into() }.kind(),
            "transient_upstream"
        );
        assert_eq!(RenderError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_display_includes_context() {
        let err = RenderError::TransientUpstream { attempts: 3, message: "HTTP 503".into() };
        assert_eq!(err.to_string(), "Upstream unavailable after 3 attempt(s): HTTP 503");

        let err = RenderError::NoRegistration("registerRender".into());
        assert!(err.to_string().contains("registerRender"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RenderError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
