//! Render Orchestrator
//!
//! Runs one render end to end:
//!
//! ```text
//! Created -> FilesRetrieved -> SandboxReady -> FilesLoaded
//!         -> CallbackRegistered -> Invoked -> Succeeded | Failed
//! ```
//!
//! Each render owns a [`Teardown`]. The resource loader, sandbox console and
//! timer guard are registered the moment they exist, and the teardown closes
//! all of them when the render finishes, fails in any phase, or its future is
//! dropped.
//!
//! File retrieval runs on the async runtime. Everything that touches the
//! script engine runs on one blocking worker, since a Boa context cannot
//! move between threads.
//!
//! The execution timeout starts when the sandbox is ready, so it covers the
//! program files as well as the callback. The teardown and the deadline are
//! checked between files.

use futures_util::future::try_join_all;
use rendergate_common::{
    AbortableOperation, RenderApi, RenderError, RenderResult, Result, SourceFile, Teardown,
};
use rendergate_fetch::{LoaderFactory, ResourceLoader};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::config::RenderConfig;
use crate::resolver::FileListResolver;
use crate::runtime::{Sandbox, SandboxConsole, SandboxLimits, TimerGuard};

/// Runs after the sandbox is set up and before any program file executes.
pub type AfterSetupHook = Arc<dyn Fn(&mut Sandbox) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPhase {
    #[default]
    Created,
    FilesRetrieved,
    SandboxReady,
    FilesLoaded,
    CallbackRegistered,
    Invoked,
    Succeeded,
    Failed,
}

impl RenderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderPhase::Created => "created",
            RenderPhase::FilesRetrieved => "files_retrieved",
            RenderPhase::SandboxReady => "sandbox_ready",
            RenderPhase::FilesLoaded => "files_loaded",
            RenderPhase::CallbackRegistered => "callback_registered",
            RenderPhase::Invoked => "invoked",
            RenderPhase::Succeeded => "succeeded",
            RenderPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of one render, shared with its blocking worker.
#[derive(Debug, Clone, Default)]
struct Progress(Arc<Mutex<RenderPhase>>);

impl Progress {
    fn advance(&self, phase: RenderPhase) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
        tracing::debug!(phase = %phase, "Render phase");
    }

    fn current(&self) -> RenderPhase {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Closes the teardown list when the render future completes or is dropped.
struct TeardownGuard(Arc<Teardown>);

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.0.close_all();
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    registration_name: Arc<str>,
    execution_timeout: Duration,
    limits: SandboxLimits,
    resolver: Arc<dyn FileListResolver>,
    loaders: Arc<dyn LoaderFactory>,
    globals: Arc<BTreeMap<String, serde_json::Value>>,
    after_setup: Option<AfterSetupHook>,
}

impl Orchestrator {
    pub fn new(resolver: Arc<dyn FileListResolver>, loaders: Arc<dyn LoaderFactory>) -> Self {
        let defaults = RenderConfig::default();
        Self {
            registration_name: Arc::from(defaults.registration_name.as_str()),
            execution_timeout: defaults.execution_timeout(),
            limits: defaults.sandbox_limits(),
            resolver,
            loaders,
            globals: Arc::new(BTreeMap::new()),
            after_setup: None,
        }
    }

    /// Builds an orchestrator from configuration: the static file list, the
    /// configured loader kind, engine limits, and any `[globals]`.
    ///
    /// # Arguments
    ///
    /// * `config` - A configuration; it is validated before use
    ///
    /// # Returns
    ///
    /// An orchestrator ready to render, or [`RenderError::Config`] when the
    /// configuration is invalid.
    ///
    /// # Example
    ///
    /// ```
    /// use rendergate_server::{Orchestrator, RenderConfig};
    ///
    /// let config = RenderConfig::from_toml_str(r#"scripts = ["app.js"]"#).unwrap();
    /// let orchestrator = Orchestrator::from_config(&config).unwrap();
    /// assert_eq!(orchestrator.registration_name(), "registerRender");
    /// ```
    pub fn from_config(config: &RenderConfig) -> Result<Self> {
        config.validate()?;
        let orchestrator = Self::new(Arc::new(config.file_list()?), config.loader_factory()?)
            .with_registration_name(&config.registration_name)
            .with_execution_timeout(config.execution_timeout())
            .with_sandbox_limits(config.sandbox_limits())
            .with_globals(config.globals_json()?);
        Ok(orchestrator)
    }

    pub fn with_registration_name(mut self, name: &str) -> Self {
        self.registration_name = Arc::from(name);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_sandbox_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_globals(mut self, globals: BTreeMap<String, serde_json::Value>) -> Self {
        self.globals = Arc::new(globals);
        self
    }

    pub fn with_after_setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Sandbox) -> Result<()> + Send + Sync + 'static,
    {
        self.after_setup = Some(Arc::new(hook));
        self
    }

    pub fn registration_name(&self) -> &str {
        &self.registration_name
    }

    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    /// Renders `url`. Dropping the returned future cancels the render and
    /// releases its resources.
    ///
    /// # Arguments
    ///
    /// * `url` - The full URL being rendered; it becomes `window.location`
    /// * `api` - Capabilities exposed to the resolver and the program
    ///
    /// # Returns
    ///
    /// The validated [`RenderResult`], or the error of the phase that failed.
    /// The loader, console and timers are closed either way.
    pub async fn render(&self, url: &str, api: Arc<dyn RenderApi>) -> Result<RenderResult> {
        let span = tracing::info_span!("render", url);
        self.render_in_span(url, api).instrument(span).await
    }

    /// [`render`](Self::render) as an [`AbortableOperation`].
    ///
    /// Aborting drops the in-flight render, which tears down its resources,
    /// and the operation resolves to [`RenderError::Cancelled`]. Aborting after
    /// it settled changes nothing.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use rendergate_common::{RenderApi, RenderError};
    /// # use rendergate_server::Orchestrator;
    /// # async fn demo(orchestrator: Orchestrator, api: Arc<dyn RenderApi>) {
    /// let render = orchestrator.render_abortable("http://localhost/", api);
    /// render.abort();
    /// assert!(matches!(render.await, Err(RenderError::Cancelled)));
    /// # }
    /// ```
    pub fn render_abortable(
        &self,
        url: &str,
        api: Arc<dyn RenderApi>,
    ) -> AbortableOperation<Result<RenderResult>> {
        let orchestrator = self.clone();
        let url = url.to_string();
        AbortableOperation::new(
            async move { orchestrator.render(&url, api).await },
            || Err(RenderError::Cancelled),
        )
    }

    async fn render_in_span(&self, url: &str, api: Arc<dyn RenderApi>) -> Result<RenderResult> {
        let started = Instant::now();
        let teardown = Arc::new(Teardown::new(url));
        let guard = TeardownGuard(teardown.clone());
        let progress = Progress::default();
        progress.advance(RenderPhase::Created);

        let result = self.run(url, api, &teardown, &progress).await;
        drop(guard);

        match &result {
            Ok(rendered) => {
                progress.advance(RenderPhase::Succeeded);
                tracing::info!(
                    status = rendered.status,
                    bytes = rendered.body.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Render succeeded"
                );
            }
            Err(RenderError::Cancelled) => {
                tracing::warn!(phase = %progress.current(), "Render cancelled");
                progress.advance(RenderPhase::Failed);
            }
            Err(e) => {
                let phase = progress.current();
                progress.advance(RenderPhase::Failed);
                tracing::error!(phase = %phase, kind = e.kind(), error = %e, "Render failed");
            }
        }
        result
    }

    async fn run(
        &self,
        url: &str,
        api: Arc<dyn RenderApi>,
        teardown: &Arc<Teardown>,
        progress: &Progress,
    ) -> Result<RenderResult> {
        let files = self
            .resolver
            .resolve(url, api.as_ref())
            .await
            .map_err(|e| match e {
                RenderError::Retrieval(_) | RenderError::Cancelled => e,
                other => RenderError::Retrieval(format!("Failed to resolve file list: {}", other)),
            })?;

        let loader = self.loaders.create()?;
        teardown.register(loader.clone().into_closeable());

        let sources = retrieve(loader.as_ref(), &files).await?;
        progress.advance(RenderPhase::FilesRetrieved);

        let orchestrator = self.clone();
        let url = url.to_string();
        let teardown = teardown.clone();
        let progress = progress.clone();
        let runtime = tokio::runtime::Handle::current();
        let span = tracing::Span::current();

        let worker = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            orchestrator.run_sandbox(&url, sources, api, loader, runtime, &teardown, &progress)
        });
        match worker.await {
            Ok(result) => result,
            Err(e) => Err(RenderError::Internal(format!("Sandbox worker failed: {}", e))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_sandbox(
        &self,
        url: &str,
        sources: Vec<SourceFile>,
        api: Arc<dyn RenderApi>,
        loader: Arc<dyn ResourceLoader>,
        runtime: tokio::runtime::Handle,
        teardown: &Teardown,
        progress: &Progress,
    ) -> Result<RenderResult> {
        if teardown.is_finished() {
            return Err(RenderError::Cancelled);
        }

        let console = Arc::new(SandboxConsole::new(url));
        teardown.register(console.clone());
        let mut sandbox = Sandbox::with_limits(url, console, self.limits)?;
        let deadline = Instant::now() + self.execution_timeout;
        progress.advance(RenderPhase::SandboxReady);

        let timers = Arc::new(TimerGuard::new());
        teardown.register(timers.clone());
        sandbox.install_timer_guard(timers)?;
        sandbox.install_fetch(loader, runtime)?;
        sandbox.install_registration(&self.registration_name)?;
        for (name, value) in self.globals.iter() {
            sandbox.set_global_json(name, value.clone())?;
        }
        if let Some(hook) = &self.after_setup {
            hook(&mut sandbox)?;
        }

        for file in &sources {
            if teardown.is_finished() {
                return Err(RenderError::Cancelled);
            }
            sandbox.execute(&file.text(), &file.url)?;
            if Instant::now() >= deadline {
                return Err(self.timed_out());
            }
        }
        sandbox.run_jobs()?;
        progress.advance(RenderPhase::FilesLoaded);

        if !sandbox.is_registered() {
            return Err(RenderError::NoRegistration(self.registration_name.to_string()));
        }
        progress.advance(RenderPhase::CallbackRegistered);

        progress.advance(RenderPhase::Invoked);
        let result = sandbox.invoke_until(api, deadline, self.execution_timeout)?;
        result.validate()?;
        Ok(result)
    }

    fn timed_out(&self) -> RenderError {
        RenderError::Timeout(self.execution_timeout.as_millis() as u64)
    }
}

/// Fetches every file through `loader`, failing on the first error. Results
/// keep the order of `files`.
async fn retrieve(loader: &dyn ResourceLoader, files: &[String]) -> Result<Vec<SourceFile>> {
    let fetches = files.iter().map(|location| {
        let operation = loader.fetch(location);
        let location = location.clone();
        async move {
            match operation.await {
                Ok(content) => Ok(SourceFile::new(location, content)),
                Err(e) => Err(match RenderError::from(e) {
                    RenderError::Retrieval(message) => {
                        RenderError::Retrieval(format!("{}: {}", location, message))
                    }
                    other => other,
                }),
            }
        }
    });
    let sources = try_join_all(fetches).await?;
    tracing::debug!(files = sources.len(), "Program files retrieved");
    Ok(sources)
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registration_name", &self.registration_name)
            .field("execution_timeout", &self.execution_timeout)
            .field("limits", &self.limits)
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .field("after_setup", &self.after_setup.is_some())
            .finish_non_exhaustive()
    }
}
