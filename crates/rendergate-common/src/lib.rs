//! rendergate common types
//!
//! Shared building blocks for the rendergate server-side rendering gateway:
//!
//! - [`error`] - the [`RenderError`] taxonomy used across all crates
//! - [`abortable`] - [`AbortableOperation`], a future with an idempotent abort signal
//! - [`closeable`] - the [`Closeable`] capability and the per-render [`Teardown`] list
//! - [`render`] - render results, source files and the [`RenderApi`] handed to sandboxed code

pub mod abortable;
pub mod closeable;
pub mod error;
pub mod render;

pub use abortable::{AbortHandle, AbortableOperation};
pub use closeable::{CloseFlag, Closeable, Teardown};
pub use error::{RenderError, Result};
pub use render::{
    RenderApi, RenderResult, RequestRenderApi, SourceFile, TimedTraceSession, TraceSession,
    REDIRECT_STATUSES,
};
