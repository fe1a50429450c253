//! Native bindings installed into a sandbox
//!
//! This is the single place where Rust functionality is exposed to sandboxed
//! JavaScript:
//!
//! - `window`, `self` and `location` derived from the render URL
//! - `console.{log,info,warn,error,debug,trace}` backed by [`SandboxConsole`]
//! - the registration point (configured name, `registerRender` by default)
//! - `setTimeout`/`setInterval`/`clearTimeout`/`clearInterval` backed by [`TimerGuard`]
//! - `fetchResource(url)` backed by the render's resource loader
//! - the render API object passed to the registered callback
//!
//! Timer callbacks and pending fetch promises are kept in closures created by
//! small JavaScript glue functions. The glue receives a host object with the
//! native entry points; that object is never reachable from the global scope.
//!
//! Shared Rust state is moved into capture structs rather than captured by
//! the closures, so each native function stays `Copy`.

use boa_engine::{
    object::{FunctionObjectBuilder, JsObject, ObjectInitializer},
    property::Attribute,
    Context, JsArgs, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};
use boa_gc::{custom_trace, empty_trace, Finalize, Trace};
use bytes::Bytes;
use rendergate_common::{RenderApi, RenderError, Result, TraceSession};
use rendergate_fetch::{FetchError, ResourceLoader};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use url::Url;

use crate::runtime::console::{ConsoleLevel, SandboxConsole};
use crate::runtime::conversions::{describe_js_error, format_console_args, is_runtime_limit};
use crate::runtime::timers::TimerGuard;

/// Property of the host object holding the registered render callback.
pub(crate) const CALLBACK_KEY: &str = "callback";

/// Browsers clamp timer delays to a signed 32-bit millisecond count.
const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

const TIMER_GLUE: &str = r#"
(function (host) {
  const callbacks = new Map();
  function schedule(handler, delay, args, repeat) {
    if (typeof handler !== 'function') {
      const source = String(handler);
      handler = function () { (0, eval)(source); };
    }
    const id = host.scheduleTimer(Number(delay) || 0, repeat);
    if (id < 0) {
      return 0;
    }
    callbacks.set(id, { handler: handler, args: args });
    return id;
  }
  function clear(id) {
    id = Number(id) || 0;
    callbacks.delete(id);
    host.cancelTimer(id);
  }
  globalThis.setTimeout = function (handler, delay, ...args) {
    return schedule(handler, delay, args, false);
  };
  globalThis.setInterval = function (handler, delay, ...args) {
    return schedule(handler, delay, args, true);
  };
  globalThis.clearTimeout = clear;
  globalThis.clearInterval = clear;
  return function fire(id, repeating) {
    const entry = callbacks.get(id);
    if (!entry) {
      return;
    }
    if (!repeating) {
      callbacks.delete(id);
    }
    entry.handler.apply(globalThis, entry.args);
  };
})
"#;

const FETCH_GLUE: &str = r#"
(function (host) {
  const pending = new Map();
  globalThis.fetchResource = function (url) {
    return new Promise(function (resolve, reject) {
      pending.set(host.startFetch(String(url)), { resolve: resolve, reject: reject });
    });
  };
  return function settle(id, ok, value) {
    const entry = pending.get(id);
    if (!entry) {
      return;
    }
    pending.delete(id);
    if (ok) {
      entry.resolve(value);
    } else {
      entry.reject(new Error(value));
    }
  };
})
"#;

/// Wraps any callback return value (plain or thenable) in an outcome box.
pub(crate) const SETTLE_GLUE: &str = r#"
(function (value) {
  const outcome = { settled: false, ok: false, value: undefined, error: undefined };
  Promise.resolve(value).then(
    function (result) { outcome.settled = true; outcome.ok = true; outcome.value = result; },
    function (error) { outcome.settled = true; outcome.error = error; }
  );
  return outcome;
})
"#;

/// Serialises a render result into a fixed JSON shape, recording which of
/// the required fields are present.
pub(crate) const NORMALIZE_GLUE: &str = r#"
(function (result) {
  if (result === null || typeof result !== 'object') {
    return JSON.stringify({ kind: result === null ? 'null' : typeof result });
  }
  const present = function (key) { return result[key] !== undefined && result[key] !== null; };
  let body = null;
  if (present('body')) {
    const raw = result.body;
    if (typeof raw === 'string') {
      body = { text: raw };
    } else if (raw instanceof Uint8Array || raw instanceof ArrayBuffer) {
      body = { bytes: Array.from(new Uint8Array(raw)) };
    } else {
      body = { text: String(raw) };
    }
  }
  let headers = null;
  if (present('headers') && typeof result.headers === 'object') {
    headers = Object.keys(result.headers).map(function (name) {
      return [name, String(result.headers[name])];
    });
  }
  return JSON.stringify({
    kind: 'object',
    body: body,
    status: present('status') ? Number(result.status) : null,
    headers: headers
  });
})
"#;

pub(crate) fn script_error(context: &str, error: &JsError, ctx: &mut Context) -> RenderError {
    if is_runtime_limit(error) {
        return RenderError::ScriptExecution(format!(
            "{}: runtime limit exceeded: {}",
            context, error
        ));
    }
    RenderError::ScriptExecution(format!("{}: {}", context, describe_js_error(error, ctx)))
}

/// Evaluates a glue expression that yields a function.
pub(crate) fn eval_function(ctx: &mut Context, source: &str) -> Result<JsObject> {
    let value = match ctx.eval(Source::from_bytes(source)) {
        Ok(value) => value,
        Err(e) => return Err(script_error("Failed to install sandbox glue", &e, ctx)),
    };
    value
        .as_object()
        .map(|o| o.clone())
        .filter(|o| o.is_callable())
        .ok_or_else(|| RenderError::Internal("sandbox glue did not evaluate to a function".into()))
}

/// Calls `function` with `args`, mapping a thrown value to a script error.
pub(crate) fn call_function(
    ctx: &mut Context,
    function: &JsObject,
    args: &[JsValue],
    context: &str,
) -> Result<JsValue> {
    match function.call(&JsValue::undefined(), args, ctx) {
        Ok(value) => Ok(value),
        Err(e) => Err(script_error(context, &e, ctx)),
    }
}

fn install_error(what: &str, error: JsError) -> RenderError {
    RenderError::Internal(format!("Failed to install {}: {}", what, error))
}

// ============================================================================
// Capture structs
// ============================================================================

#[derive(Finalize)]
struct ConsoleCapture {
    console: Arc<SandboxConsole>,
    level: ConsoleLevel,
}

unsafe impl Trace for ConsoleCapture {
    empty_trace!();
}

#[derive(Finalize)]
struct RegistrationCapture {
    host: JsObject,
    name: String,
    registrations: Arc<AtomicU32>,
}

unsafe impl Trace for RegistrationCapture {
    custom_trace!(this, mark, {
        mark(&this.host);
    });
}

#[derive(Finalize)]
struct TimerCapture {
    guard: Arc<TimerGuard>,
}

unsafe impl Trace for TimerCapture {
    empty_trace!();
}

/// A finished in-sandbox fetch, delivered back to the sandbox thread.
#[derive(Debug)]
pub(crate) struct FetchCompletion {
    pub id: u32,
    pub result: std::result::Result<Bytes, FetchError>,
}

#[derive(Finalize)]
struct FetchCapture {
    loader: Arc<dyn ResourceLoader>,
    runtime: tokio::runtime::Handle,
    sender: mpsc::Sender<FetchCompletion>,
    next_id: Arc<AtomicU32>,
    in_flight: Arc<AtomicUsize>,
}

unsafe impl Trace for FetchCapture {
    empty_trace!();
}

#[derive(Finalize)]
struct ApiCapture {
    api: Arc<dyn RenderApi>,
}

unsafe impl Trace for ApiCapture {
    empty_trace!();
}

#[derive(Finalize)]
struct SessionCapture {
    session: Rc<RefCell<Box<dyn TraceSession>>>,
}

unsafe impl Trace for SessionCapture {
    empty_trace!();
}

// ============================================================================
// Globals
// ============================================================================

/// Installs `window`, `self` and `location`.
pub(crate) fn install_window(ctx: &mut Context, url: &Url) -> Result<()> {
    let host = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    let search = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
    let fields = [
        ("href", url.as_str().to_string()),
        ("protocol", format!("{}:", url.scheme())),
        ("host", host),
        ("hostname", url.host_str().unwrap_or_default().to_string()),
        ("pathname", url.path().to_string()),
        ("search", search),
        ("origin", url.origin().ascii_serialization()),
    ];

    let mut location = ObjectInitializer::new(ctx);
    for (name, value) in fields {
        location.property(
            JsString::from(name),
            JsString::from(value.as_str()),
            Attribute::all(),
        );
    }
    let location = location.build();

    let global = ctx.global_object();
    for name in ["window", "self"] {
        ctx.register_global_property(JsString::from(name), global.clone(), Attribute::all())
            .map_err(|e| install_error(name, e))?;
    }
    ctx.register_global_property(JsString::from("location"), location, Attribute::all())
        .map_err(|e| install_error("location", e))?;
    Ok(())
}

fn console_method(console: Arc<SandboxConsole>, level: ConsoleLevel) -> NativeFunction {
    NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let message = format_console_args(args, ctx);
            captures.console.emit(captures.level, &message);
            Ok(JsValue::undefined())
        },
        ConsoleCapture { console, level },
    )
}

pub(crate) fn install_console(ctx: &mut Context, console: Arc<SandboxConsole>) -> Result<()> {
    let mut object = ObjectInitializer::new(ctx);
    for method in ["log", "info", "warn", "error", "debug", "trace"] {
        object.function(
            console_method(console.clone(), ConsoleLevel::from_method(method)),
            JsString::from(method),
            0,
        );
    }
    let object = object.build();

    ctx.register_global_property(JsString::from("console"), object, Attribute::all())
        .map_err(|e| install_error("console", e))
}

// ============================================================================
// Registration point
// ============================================================================

/// Installs the global registration function `name`. A registered callback
/// is stored on `host` under [`CALLBACK_KEY`]; registering again replaces it.
pub(crate) fn install_registration(
    ctx: &mut Context,
    host: &JsObject,
    name: &str,
    registrations: Arc<AtomicU32>,
) -> Result<()> {
    let register = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let callback = args.get_or_undefined(0);
            let callable = callback.as_object().map(|o| o.is_callable()).unwrap_or(false);
            if !callable {
                return Err(JsNativeError::typ()
                    .with_message(format!("{} expects a function", captures.name))
                    .into());
            }

            if captures.registrations.fetch_add(1, Ordering::SeqCst) > 0 {
                tracing::warn!(
                    "'{}' called more than once; the latest callback replaces the previous one",
                    captures.name
                );
            }
            captures
                .host
                .set(JsString::from(CALLBACK_KEY), callback.clone(), true, ctx)?;
            Ok(JsValue::undefined())
        },
        RegistrationCapture {
            host: host.clone(),
            name: name.to_string(),
            registrations,
        },
    );

    ctx.register_global_builtin_callable(JsString::from(name), 1, register)
        .map_err(|e| install_error(name, e))
}

// ============================================================================
// Timers
// ============================================================================

/// Installs the timer globals. Returns the glue's `fire(id, repeating)` function.
pub(crate) fn install_timers(ctx: &mut Context, guard: Arc<TimerGuard>) -> Result<JsObject> {
    let schedule = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let delay = args.get_or_undefined(0).to_number(ctx)?;
            let delay = if delay.is_finite() && delay > 0.0 {
                delay.min(MAX_TIMER_DELAY_MS)
            } else {
                0.0
            };
            let repeat = args.get_or_undefined(1).to_boolean();
            let id = captures
                .guard
                .schedule(std::time::Duration::from_millis(delay as u64), repeat);
            Ok(id.map(JsValue::from).unwrap_or_else(|| JsValue::from(-1)))
        },
        TimerCapture { guard: guard.clone() },
    );

    let cancel = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let id = args.get_or_undefined(0).to_number(ctx)?;
            if id.is_finite() && id >= 1.0 && id <= u32::MAX as f64 {
                captures.guard.cancel(id as u32);
            }
            Ok(JsValue::undefined())
        },
        TimerCapture { guard },
    );

    let host = ObjectInitializer::new(ctx)
        .function(schedule, JsString::from("scheduleTimer"), 2)
        .function(cancel, JsString::from("cancelTimer"), 1)
        .build();

    let glue = eval_function(ctx, TIMER_GLUE)?;
    let fire = call_function(ctx, &glue, &[host.into()], "Failed to install timers")?;
    fire.as_object()
        .map(|o| o.clone())
        .ok_or_else(|| RenderError::Internal("timer glue returned no dispatcher".into()))
}

// ============================================================================
// In-sandbox fetch
// ============================================================================

/// Installs `fetchResource`. Completed fetches arrive on the returned
/// receiver; the returned function settles the matching promise.
pub(crate) fn install_fetch(
    ctx: &mut Context,
    loader: Arc<dyn ResourceLoader>,
    runtime: tokio::runtime::Handle,
    in_flight: Arc<AtomicUsize>,
) -> Result<(JsObject, mpsc::Receiver<FetchCompletion>)> {
    let (sender, receiver) = mpsc::channel();

    let start = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let url = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            let id = captures.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            captures.in_flight.fetch_add(1, Ordering::SeqCst);

            let operation = captures.loader.fetch(&url);
            let sender = captures.sender.clone();
            captures.runtime.spawn(async move {
                let result = operation.await;
                // The sandbox may already be gone; nothing to deliver to then.
                let _ = sender.send(FetchCompletion { id, result });
            });

            Ok(JsValue::from(id))
        },
        FetchCapture {
            loader,
            runtime,
            sender,
            next_id: Arc::new(AtomicU32::new(0)),
            in_flight,
        },
    );

    let host = ObjectInitializer::new(ctx)
        .function(start, JsString::from("startFetch"), 1)
        .build();

    let glue = eval_function(ctx, FETCH_GLUE)?;
    let settle = call_function(ctx, &glue, &[host.into()], "Failed to install fetchResource")?;
    let settle = settle
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| RenderError::Internal("fetch glue returned no dispatcher".into()))?;
    Ok((settle, receiver))
}

// ============================================================================
// Render API
// ============================================================================

fn trace_session_object(ctx: &mut Context, session: Box<dyn TraceSession>) -> JsObject {
    let session = Rc::new(RefCell::new(session));

    let add_label = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let key = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            let value = args.get_or_undefined(1).to_string(ctx)?.to_std_string_escaped();
            captures.session.borrow_mut().add_label(&key, &value);
            Ok(JsValue::undefined())
        },
        SessionCapture { session: session.clone() },
    );

    let end = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures, _ctx| {
            captures.session.borrow_mut().end();
            Ok(JsValue::undefined())
        },
        SessionCapture { session },
    );

    ObjectInitializer::new(ctx)
        .function(add_label, JsString::from("addLabel"), 2)
        .function(end, JsString::from("end"), 0)
        .build()
}

/// Builds `{ getHeader(name), trace(name) }` for one callback invocation.
pub(crate) fn render_api_object(ctx: &mut Context, api: Arc<dyn RenderApi>) -> JsObject {
    let get_header = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| {
            let name = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            Ok(match captures.api.header(&name) {
                Some(value) => JsValue::from(JsString::from(value.as_str())),
                None => JsValue::null(),
            })
        },
        ApiCapture { api: api.clone() },
    );

    let trace = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, ctx| -> JsResult<JsValue> {
            let name = args.get_or_undefined(0).to_string(ctx)?.to_std_string_escaped();
            let session = captures.api.trace(&name);
            Ok(trace_session_object(ctx, session).into())
        },
        ApiCapture { api },
    );

    let get_header = FunctionObjectBuilder::new(ctx.realm(), get_header)
        .name(JsString::from("getHeader"))
        .length(1)
        .build();

    ObjectInitializer::new(ctx)
        .property(JsString::from("getHeader"), get_header, Attribute::all())
        .function(trace, JsString::from("trace"), 1)
        .build()
}
