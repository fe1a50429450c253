//! Closeable resources and per-render teardown
//!
//! Every resource a render acquires (resource loader, sandbox console, timer
//! guard) implements [`Closeable`] and is registered with the render's
//! [`Teardown`] as soon as it exists. The teardown closes each registered
//! resource exactly once, whether the render succeeds, fails, or its future is
//! dropped mid-flight.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A resource with an idempotent release operation.
pub trait Closeable: Send + Sync {
    /// Short name used in teardown logs.
    fn name(&self) -> &str;

    /// Releases the resource. Calling it again must be a no-op.
    fn close(&self) -> Result<()>;
}

/// Single authoritative open/closed state for a component.
///
/// Callbacks that need to know whether their owner is still live read this
/// flag instead of capturing a copy of it.
#[derive(Debug, Default)]
pub struct CloseFlag(AtomicBool);

impl CloseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flips the flag to closed. Returns `true` only for the call that
    /// performed the transition.
    pub fn close(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered set of closeables acquired by one render.
pub struct Teardown {
    label: String,
    finished: CloseFlag,
    pending: Mutex<Vec<Arc<dyn Closeable>>>,
    closed: Mutex<Vec<String>>,
}

impl Teardown {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            finished: CloseFlag::new(),
            pending: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Tracks a resource for teardown.
    ///
    /// A resource registered after [`close_all`](Self::close_all) has already
    /// run is closed immediately.
    pub fn register(&self, resource: Arc<dyn Closeable>) {
        {
            let mut pending = lock(&self.pending);
            if !self.finished.is_closed() {
                pending.push(resource);
                return;
            }
        }
        self.close_one(resource);
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_finished(&self) -> bool {
        self.finished.is_closed()
    }

    /// Number of resources still awaiting teardown.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Names of the resources closed so far, in closing order.
    pub fn closed(&self) -> Vec<String> {
        lock(&self.closed).clone()
    }

    /// Closes every registered resource in reverse registration order.
    ///
    /// A failing `close()` is logged and does not stop the remaining
    /// resources from being closed.
    pub fn close_all(&self) {
        let resources = {
            let mut pending = lock(&self.pending);
            self.finished.close();
            std::mem::take(&mut *pending)
        };

        for resource in resources.into_iter().rev() {
            self.close_one(resource);
        }
    }

    fn close_one(&self, resource: Arc<dyn Closeable>) {
        match resource.close() {
            Ok(()) => {
                tracing::debug!(render = %self.label, resource = resource.name(), "Closed");
            }
            Err(e) => {
                tracing::warn!(
                    render = %self.label,
                    resource = resource.name(),
                    "Failed to close resource: {}",
                    e
                );
            }
        }
        lock(&self.closed).push(resource.name().to_string());
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("label", &self.label)
            .field("pending", &self.pending())
            .field("closed", &self.closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        name: &'static str,
        closes: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self { name, closes: AtomicUsize::new(0), fail })
        }
    }

    impl Closeable for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RenderError::Internal("close failed".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_close_flag_transitions_once() {
        let flag = CloseFlag::new();
        assert!(!flag.is_closed());
        assert!(flag.close());
        assert!(!flag.close());
        assert!(flag.is_closed());
    }

    #[test]
    fn test_close_all_closes_each_once_in_reverse_order() {
        let teardown = Teardown::new("test");
        let a = Counting::new("a", false);
        let b = Counting::new("b", false);
        teardown.register(a.clone());
        teardown.register(b.clone());

        teardown.close_all();
        teardown.close_all();
        drop(teardown);

        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_close_does_not_stop_others() {
        let teardown = Teardown::new("test");
        let first = Counting::new("first", false);
        let broken = Counting::new("broken", true);
        let last = Counting::new("last", false);
        teardown.register(first.clone());
        teardown.register(broken.clone());
        teardown.register(last.clone());

        teardown.close_all();

        assert_eq!(teardown.closed(), vec!["last", "broken", "first"]);
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(last.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_pending() {
        let a = Counting::new("a", false);
        {
            let teardown = Teardown::new("test");
            teardown.register(a.clone());
        }
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_close_all_closes_immediately() {
        let teardown = Teardown::new("test");
        teardown.close_all();
        assert!(teardown.is_finished());

        let late = Counting::new("late", false);
        teardown.register(late.clone());
        assert_eq!(late.closes.load(Ordering::SeqCst), 1);
        assert_eq!(teardown.pending(), 0);
    }
}
