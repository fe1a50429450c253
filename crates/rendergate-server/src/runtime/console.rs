//! Closeable Console
//!
//! Receives console output and engine-internal errors from one sandbox and
//! forwards them to `tracing` under the `rendergate::sandbox` target, each
//! line prefixed with `[sandbox]`. After `close()` every event is dropped.

use rendergate_common::{CloseFlag, Closeable, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Expected noise from blocked image fetches.
const IGNORED_ERROR: &str = "Could not load img";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl ConsoleLevel {
    /// Maps a `console.*` method name to a level.
    pub fn from_method(method: &str) -> Self {
        match method {
            "error" => ConsoleLevel::Error,
            "warn" => ConsoleLevel::Warn,
            "debug" => ConsoleLevel::Debug,
            "trace" => ConsoleLevel::Trace,
            _ => ConsoleLevel::Info,
        }
    }
}

#[derive(Debug)]
pub struct SandboxConsole {
    url: String,
    closed: CloseFlag,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl SandboxConsole {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            closed: CloseFlag::new(),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Forwards one console line. Returns `false` if it was dropped.
    pub fn emit(&self, level: ConsoleLevel, message: &str) -> bool {
        if self.closed.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let url = self.url.as_str();
        match level {
            ConsoleLevel::Error => {
                tracing::error!(target: "rendergate::sandbox", url, "[sandbox] {}", message)
            }
            ConsoleLevel::Warn => {
                tracing::warn!(target: "rendergate::sandbox", url, "[sandbox] {}", message)
            }
            ConsoleLevel::Info => {
                tracing::info!(target: "rendergate::sandbox", url, "[sandbox] {}", message)
            }
            ConsoleLevel::Debug => {
                tracing::debug!(target: "rendergate::sandbox", url, "[sandbox] {}", message)
            }
            ConsoleLevel::Trace => {
                tracing::trace!(target: "rendergate::sandbox", url, "[sandbox] {}", message)
            }
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Reports an error raised by the sandbox itself rather than by
    /// `console.error`, such as an exception thrown from a timer callback.
    pub fn internal_error(&self, message: &str) -> bool {
        if message.contains(IGNORED_ERROR) {
            return false;
        }
        self.emit(ConsoleLevel::Error, message)
    }

    /// Events forwarded so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Events discarded because the console was closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl Closeable for SandboxConsole {
    fn name(&self) -> &str {
        "sandbox-console"
    }

    fn close(&self) -> Result<()> {
        self.closed.close();
        Ok(())
    }
}
