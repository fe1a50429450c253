//! Render Sandbox
//!
//! Wraps one Boa [`Context`] for one render. The sandbox is created, used and
//! dropped on a single blocking worker because a Boa context is not `Send`.
//!
//! After the program files have executed and registered a callback,
//! [`Sandbox::invoke`] calls it and drives a small event loop until the
//! returned value settles:
//!
//! 1. run pending promise jobs
//! 2. stop if the outcome settled, the timer guard was closed (cancellation)
//!    or the execution timeout elapsed
//! 3. deliver completed `fetchResource` calls and fire due timers
//! 4. otherwise wait for the next timer deadline or fetch completion
//!
//! Synchronous work cannot be interrupted from outside, so every context
//! carries [`SandboxLimits`]: a runaway loop or recursion fails with a script
//! error instead of pinning the worker. Once such work returns, the deadline
//! is checked before its value is accepted.

use boa_engine::{object::JsObject, object::ObjectInitializer, Context, JsError, JsString, JsValue, Source};
use rendergate_common::{RenderApi, RenderError, RenderResult, Result};
use rendergate_fetch::ResourceLoader;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use url::Url;

use crate::runtime::bindings::{self, FetchCompletion, CALLBACK_KEY};
use crate::runtime::console::SandboxConsole;
use crate::runtime::conversions::{describe_js_error, js_value_to_json, json_to_js_value};
use crate::runtime::timers::{DueTimer, TimerGuard};

/// Longest single wait inside the event loop, so cancellation is noticed promptly.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Engine limits applied to every context a sandbox creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Iterations a single loop may run before it is aborted
    pub loop_iterations: u64,
    /// Maximum call depth
    pub recursion: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            loop_iterations: 10_000_000,
            recursion: 512,
        }
    }
}

struct Registration {
    name: String,
    count: Arc<AtomicU32>,
}

struct TimerBridge {
    guard: Arc<TimerGuard>,
    fire: JsObject,
}

struct FetchBridge {
    settle: JsObject,
    completions: mpsc::Receiver<FetchCompletion>,
    in_flight: Arc<AtomicUsize>,
}

/// Result shape produced by the normalisation glue.
#[derive(Debug, Deserialize)]
struct RawResult {
    kind: String,
    #[serde(default)]
    body: Option<RawBody>,
    #[serde(default)]
    status: Option<f64>,
    #[serde(default)]
    headers: Option<Vec<(String, String)>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBody {
    Text { text: String },
    Bytes { bytes: Vec<u8> },
}

pub struct Sandbox {
    context: Context,
    url: Url,
    console: Arc<SandboxConsole>,
    host: JsObject,
    settle_outcome: JsObject,
    normalize: JsObject,
    registration: Option<Registration>,
    timers: Option<TimerBridge>,
    fetches: Option<FetchBridge>,
}

impl Sandbox {
    /// Creates a sandbox for `url` with `window`, `location` and `console`
    /// installed, using the default [`SandboxLimits`].
    pub fn new(url: &str, console: Arc<SandboxConsole>) -> Result<Self> {
        Self::with_limits(url, console, SandboxLimits::default())
    }

    /// Creates a sandbox whose engine enforces `limits`.
    ///
    /// # Arguments
    ///
    /// * `url` - The render URL; `location` is derived from it
    /// * `console` - Receives everything the program logs
    /// * `limits` - Loop and recursion bounds for all code run in the sandbox
    ///
    /// # Errors
    ///
    /// [`RenderError::InvalidInput`] if `url` does not parse.
    pub fn with_limits(
        url: &str,
        console: Arc<SandboxConsole>,
        limits: SandboxLimits,
    ) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| RenderError::InvalidInput(format!("Invalid render URL '{}': {}", url, e)))?;

        let mut context = Context::default();
        let runtime_limits = context.runtime_limits_mut();
        runtime_limits.set_loop_iteration_limit(limits.loop_iterations);
        runtime_limits.set_recursion_limit(limits.recursion);

        bindings::install_window(&mut context, &url)?;
        bindings::install_console(&mut context, console.clone())?;
        let host = ObjectInitializer::new(&mut context).build();
        let settle_outcome = bindings::eval_function(&mut context, bindings::SETTLE_GLUE)?;
        let normalize = bindings::eval_function(&mut context, bindings::NORMALIZE_GLUE)?;

        Ok(Self {
            context,
            url,
            console,
            host,
            settle_outcome,
            normalize,
            registration: None,
            timers: None,
            fetches: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn console(&self) -> &Arc<SandboxConsole> {
        &self.console
    }

    pub fn timer_guard(&self) -> Option<&Arc<TimerGuard>> {
        self.timers.as_ref().map(|t| &t.guard)
    }

    /// Direct access to the engine context, for after-setup hooks.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Executes `source` at global scope.
    ///
    /// # Arguments
    ///
    /// * `source` - Program text
    /// * `label` - Names the file in errors and in the engine's diagnostics
    ///
    /// # Returns
    ///
    /// The completion value, or [`RenderError::ScriptExecution`] for a thrown
    /// error, a syntax error or an exceeded engine limit.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use rendergate_server::{Sandbox, SandboxConsole};
    ///
    /// let url = "https://shop.test/";
    /// let mut sandbox = Sandbox::new(url, Arc::new(SandboxConsole::new(url))).unwrap();
    /// sandbox.execute("var answer = 6 * 7;", "answer.js").unwrap();
    /// assert_eq!(sandbox.get_global_json("answer").unwrap(), 42);
    /// ```
    pub fn execute(&mut self, source: &str, label: &str) -> Result<JsValue> {
        let source = Source::from_bytes(source).with_path(Path::new(label));
        match self.context.eval(source) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.script_error(label, &e)),
        }
    }

    /// Runs queued promise jobs until the queue is empty.
    pub fn run_jobs(&mut self) -> Result<()> {
        match self.context.run_jobs() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.script_error("promise job", &e)),
        }
    }

    pub fn set_global(&mut self, name: &str, value: JsValue) -> Result<()> {
        let global = self.context.global_object();
        global
            .set(JsString::from(name), value, true, &mut self.context)
            .map_err(|e| RenderError::Internal(format!("Failed to set global '{}': {}", name, e)))?;
        Ok(())
    }

    /// Sets a global from a JSON value.
    pub fn set_global_json(&mut self, name: &str, value: serde_json::Value) -> Result<()> {
        let value = json_to_js_value(value, &mut self.context)?;
        self.set_global(name, value)
    }

    pub fn get_global(&mut self, name: &str) -> Result<JsValue> {
        let global = self.context.global_object();
        global
            .get(JsString::from(name), &mut self.context)
            .map_err(|e| RenderError::Internal(format!("Failed to read global '{}': {}", name, e)))
    }

    /// Reads a global as JSON.
    pub fn get_global_json(&mut self, name: &str) -> Result<serde_json::Value> {
        let value = self.get_global(name)?;
        js_value_to_json(&value, &mut self.context)
    }

    /// Routes `setTimeout`/`setInterval` through `guard`.
    pub fn install_timer_guard(&mut self, guard: Arc<TimerGuard>) -> Result<()> {
        let fire = bindings::install_timers(&mut self.context, guard.clone())?;
        self.timers = Some(TimerBridge { guard, fire });
        Ok(())
    }

    /// Exposes `fetchResource(url)` backed by `loader`. Fetches run on `runtime`.
    pub fn install_fetch(
        &mut self,
        loader: Arc<dyn ResourceLoader>,
        runtime: tokio::runtime::Handle,
    ) -> Result<()> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (settle, completions) =
            bindings::install_fetch(&mut self.context, loader, runtime, in_flight.clone())?;
        self.fetches = Some(FetchBridge {
            settle,
            completions,
            in_flight,
        });
        Ok(())
    }

    /// Installs the global registration function under `name`.
    pub fn install_registration(&mut self, name: &str) -> Result<()> {
        let count = Arc::new(AtomicU32::new(0));
        bindings::install_registration(&mut self.context, &self.host, name, count.clone())?;
        self.registration = Some(Registration {
            name: name.to_string(),
            count,
        });
        Ok(())
    }

    /// Number of times the registration point has been called.
    pub fn registrations(&self) -> u32 {
        self.registration
            .as_ref()
            .map(|r| r.count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_registered(&self) -> bool {
        self.registrations() > 0
    }

    fn registration_name(&self) -> String {
        self.registration
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_default()
    }

    fn registered_callback(&mut self) -> Result<JsObject> {
        let callback = self
            .host
            .get(JsString::from(CALLBACK_KEY), &mut self.context)
            .map_err(|e| RenderError::Internal(format!("Failed to read render callback: {}", e)))?;
        callback
            .as_object()
            .map(|o| o.clone())
            .filter(|o| o.is_callable())
            .ok_or_else(|| RenderError::NoRegistration(self.registration_name()))
    }

    /// Calls the registered callback with `api` and waits for its result.
    pub fn invoke(&mut self, api: Arc<dyn RenderApi>, timeout: Duration) -> Result<RenderResult> {
        self.invoke_until(api, Instant::now() + timeout, timeout)
    }

    /// Like [`invoke`](Self::invoke), but against a deadline that may have
    /// started earlier, e.g. before the program files ran.
    ///
    /// # Arguments
    ///
    /// * `api` - Capabilities handed to the callback as its only argument
    /// * `deadline` - Instant by which the returned value must have settled
    /// * `budget` - The configured timeout, reported in [`RenderError::Timeout`]
    ///
    /// # Returns
    ///
    /// The callback's result, read but not validated.
    pub fn invoke_until(
        &mut self,
        api: Arc<dyn RenderApi>,
        deadline: Instant,
        budget: Duration,
    ) -> Result<RenderResult> {
        let callback = self.registered_callback()?;
        if Instant::now() >= deadline {
            return Err(RenderError::Timeout(budget.as_millis() as u64));
        }
        let api_object = bindings::render_api_object(&mut self.context, api);

        let returned = match callback.call(&JsValue::undefined(), &[api_object.into()], &mut self.context) {
            Ok(value) => value,
            Err(e) => return Err(self.script_error("render callback", &e)),
        };
        let outcome = bindings::call_function(
            &mut self.context,
            &self.settle_outcome,
            &[returned],
            "render callback",
        )?;
        let outcome = outcome
            .as_object()
            .map(|o| o.clone())
            .ok_or_else(|| RenderError::Internal("render outcome is not an object".into()))?;

        let value = self.drive(&outcome, deadline, budget)?;
        self.read_result(value)
    }

    fn outcome_field(&mut self, outcome: &JsObject, field: &str) -> Result<JsValue> {
        outcome
            .get(JsString::from(field), &mut self.context)
            .map_err(|e| RenderError::Internal(format!("Failed to read outcome '{}': {}", field, e)))
    }

    fn is_cancelled(&self) -> bool {
        self.timers
            .as_ref()
            .map(|t| t.guard.is_closed())
            .unwrap_or(false)
    }

    fn drive(&mut self, outcome: &JsObject, deadline: Instant, budget: Duration) -> Result<JsValue> {
        loop {
            self.run_jobs()?;
            if self.is_cancelled() {
                return Err(RenderError::Cancelled);
            }
            // A value produced after the deadline is still a timeout.
            let now = Instant::now();
            if now >= deadline {
                return Err(RenderError::Timeout(budget.as_millis() as u64));
            }
            if self.outcome_field(outcome, "settled")?.to_boolean() {
                break;
            }
            if self.pump(now)? {
                continue;
            }
            self.wait(now, deadline)?;
        }

        if self.outcome_field(outcome, "ok")?.to_boolean() {
            return self.outcome_field(outcome, "value");
        }
        let error = self.outcome_field(outcome, "error")?;
        let error = JsError::from_opaque(error);
        Err(self.script_error("render callback rejected", &error))
    }

    /// Delivers finished fetches and fires due timers. Returns `true` if
    /// anything ran.
    fn pump(&mut self, now: Instant) -> Result<bool> {
        let completions: Vec<FetchCompletion> = match &self.fetches {
            Some(fetches) => fetches.completions.try_iter().collect(),
            None => Vec::new(),
        };
        let due: Vec<DueTimer> = match &self.timers {
            Some(timers) => timers.guard.take_due(now),
            None => Vec::new(),
        };
        let progressed = !completions.is_empty() || !due.is_empty();

        for completion in completions {
            self.deliver_fetch(completion)?;
        }
        for timer in due {
            self.fire_timer(timer);
        }
        Ok(progressed)
    }

    /// Blocks until the next timer deadline, a fetch completion, or one
    /// wait slice, whichever comes first.
    fn wait(&mut self, now: Instant, deadline: Instant) -> Result<()> {
        let next_timer = self.timers.as_ref().and_then(|t| t.guard.next_deadline());
        let in_flight = self
            .fetches
            .as_ref()
            .map(|f| f.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0);
        if next_timer.is_none() && in_flight == 0 {
            return Err(RenderError::ScriptExecution(
                "render callback returned a promise that can never settle".into(),
            ));
        }

        let mut wake = deadline.min(now + MAX_WAIT_SLICE);
        if let Some(next) = next_timer {
            wake = wake.min(next);
        }
        let wait = wake.saturating_duration_since(now);

        if in_flight == 0 {
            std::thread::sleep(wait);
            return Ok(());
        }
        let received = match &self.fetches {
            Some(fetches) => fetches.completions.recv_timeout(wait).ok(),
            None => None,
        };
        if let Some(completion) = received {
            self.deliver_fetch(completion)?;
        }
        Ok(())
    }

    fn deliver_fetch(&mut self, completion: FetchCompletion) -> Result<()> {
        let settle = match &self.fetches {
            Some(fetches) => {
                fetches.in_flight.fetch_sub(1, Ordering::SeqCst);
                fetches.settle.clone()
            }
            None => return Ok(()),
        };

        let (ok, value) = match completion.result {
            Ok(body) => (true, String::from_utf8_lossy(&body).into_owned()),
            Err(e) => (false, e.to_string()),
        };
        bindings::call_function(
            &mut self.context,
            &settle,
            &[
                JsValue::from(completion.id),
                JsValue::from(ok),
                JsValue::from(JsString::from(value.as_str())),
            ],
            "fetchResource",
        )?;
        Ok(())
    }

    /// Fires one timer. Errors thrown by the callback are reported to the
    /// console and do not fail the render.
    fn fire_timer(&mut self, timer: DueTimer) {
        let fire = match &self.timers {
            Some(timers) => timers.fire.clone(),
            None => return,
        };
        let result = fire.call(
            &JsValue::undefined(),
            &[JsValue::from(timer.id), JsValue::from(timer.repeating)],
            &mut self.context,
        );
        if let Err(e) = result {
            let message = describe_js_error(&e, &mut self.context);
            self.console
                .internal_error(&format!("Uncaught error in timer callback: {}", message));
        }
    }

    fn read_result(&mut self, value: JsValue) -> Result<RenderResult> {
        let normalize = self.normalize.clone();
        let json = bindings::call_function(&mut self.context, &normalize, &[value], "render result")?;
        let json = json
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .ok_or_else(|| RenderError::Internal("render result normalisation failed".into()))?;
        let raw: RawResult = serde_json::from_str(&json)
            .map_err(|e| RenderError::MalformedResult(format!("unreadable render result: {}", e)))?;

        if raw.kind != "object" {
            return Err(RenderError::MalformedResult(format!(
                "render callback returned {} instead of an object",
                raw.kind
            )));
        }
        let body = raw
            .body
            .ok_or_else(|| RenderError::MalformedResult("missing field 'body'".into()))?;
        let status = raw
            .status
            .ok_or_else(|| RenderError::MalformedResult("missing field 'status'".into()))?;
        let headers = raw
            .headers
            .ok_or_else(|| RenderError::MalformedResult("missing field 'headers'".into()))?;

        if status.fract() != 0.0 || !(0.0..=f64::from(u16::MAX)).contains(&status) {
            return Err(RenderError::MalformedResult(format!(
                "status {} is not an integer HTTP status",
                status
            )));
        }

        let body = match body {
            RawBody::Text { text } => bytes::Bytes::from(text),
            RawBody::Bytes { bytes } => bytes::Bytes::from(bytes),
        };
        Ok(RenderResult {
            body,
            status: status as u16,
            headers: headers.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }

    fn script_error(&mut self, label: &str, error: &JsError) -> RenderError {
        bindings::script_error(label, error, &mut self.context)
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("url", &self.url.as_str())
            .field("registrations", &self.registrations())
            .field("timers", &self.timers.is_some())
            .field("fetch", &self.fetches.is_some())
            .finish()
    }
}
