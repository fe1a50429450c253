//! rendergate server
//!
//! Server-side rendering gateway: for each request URL it retrieves a list of
//! program files, executes them in a fresh Boa sandbox, invokes the render
//! callback they register and returns the resulting body, status and headers.

pub mod config;
pub mod http_router;
pub mod http_server;
pub mod orchestrator;
pub mod resolver;
pub mod runtime;

pub use config::{CacheConfig, FetchConfig, LimitsConfig, LoaderConfig, LoaderKind, RenderConfig};
pub use http_router::{render_target, ErrorHandler, HttpResponse, RenderRouter};
pub use http_server::HttpServer;
pub use orchestrator::{AfterSetupHook, Orchestrator, RenderPhase};
pub use resolver::{FileListResolver, FnFileList, StaticFileList};
pub use runtime::{Sandbox, SandboxConsole, SandboxLimits, TimerGuard};
