//! Abortable operations
//!
//! An [`AbortableOperation`] is a boxed future paired with an explicit,
//! idempotent cancellation signal. It is the primitive every fetch in the
//! resource layer is built on, so chaining must never lose the ability to
//! cancel: [`map`](AbortableOperation::map) and
//! [`then`](AbortableOperation::then) hand the derived operation a handle that
//! cancels the original work.
//!
//! An aborted operation still resolves: awaiting it yields the fallback value
//! supplied at construction, and the in-flight work is dropped immediately.

use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

/// Cancellation handle for an [`AbortableOperation`].
///
/// Cloning the handle is cheap; every clone controls the same operation.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
    aborted: Arc<AtomicBool>,
    settled: Arc<AtomicBool>,
}

impl AbortHandle {
    fn fresh(settled: bool) -> Self {
        Self {
            token: CancellationToken::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            settled: Arc::new(AtomicBool::new(settled)),
        }
    }

    /// Cancels the operation. A no-op once the operation has settled, and
    /// safe to call any number of times.
    pub fn abort(&self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        self.aborted.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Whether the operation was aborted before it settled.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether the operation has produced its value.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

/// A future with an attached [`AbortHandle`].
///
/// # Example
///
/// ```
/// use rendergate_common::AbortableOperation;
///
/// # #[tokio::main]
/// # async fn main() {
/// let op = AbortableOperation::new(
///     async { std::future::pending::<u32>().await },
///     || 0,
/// );
/// op.abort();
/// assert_eq!(op.await, 0);
/// # }
/// ```
pub struct AbortableOperation<T> {
    future: BoxFuture<'static, T>,
    handle: AbortHandle,
}

impl<T: Send + 'static> AbortableOperation<T> {
    /// Wraps `work`; if aborted before it completes, the operation resolves to
    /// `on_abort()` instead.
    pub fn new<F, A>(work: F, on_abort: A) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        A: FnOnce() -> T + Send + 'static,
    {
        let handle = AbortHandle::fresh(false);
        Self::guarded(handle.token.clone(), handle.aborted.clone(), work, on_abort)
    }

    /// An operation that has already settled with `value`.
    pub fn ready(value: T) -> Self {
        Self {
            future: futures_util::future::ready(value).boxed(),
            handle: AbortHandle::fresh(true),
        }
    }

    fn guarded<F, A>(
        token: CancellationToken,
        aborted: Arc<AtomicBool>,
        work: F,
        on_abort: A,
    ) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        A: FnOnce() -> T + Send + 'static,
    {
        let settled = Arc::new(AtomicBool::new(false));
        let handle = AbortHandle {
            token: token.clone(),
            aborted,
            settled: settled.clone(),
        };

        let future = async move {
            let output = tokio::select! {
                biased;
                _ = token.cancelled() => on_abort(),
                value = work => value,
            };
            settled.store(true, Ordering::SeqCst);
            output
        }
        .boxed();

        Self { future, handle }
    }

    /// Returns a clone of the cancellation handle.
    pub fn handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    pub fn is_settled(&self) -> bool {
        self.handle.is_settled()
    }

    /// Transforms the eventual value. Aborting the derived operation aborts
    /// the original work; an aborted original flows through `f` as its
    /// fallback value.
    pub fn map<U, M>(self, f: M) -> AbortableOperation<U>
    where
        U: Send + 'static,
        M: FnOnce(T) -> U + Send + 'static,
    {
        let AbortableOperation { future, handle } = self;
        let settled = Arc::new(AtomicBool::new(handle.is_settled()));
        let derived = AbortHandle {
            token: handle.token.clone(),
            aborted: handle.aborted.clone(),
            settled: settled.clone(),
        };

        let future = async move {
            let value = future.await;
            settled.store(true, Ordering::SeqCst);
            f(value)
        }
        .boxed();

        AbortableOperation { future, handle: derived }
    }

    /// Chains an asynchronous continuation. Both stages observe the same
    /// cancellation signal; aborting during either stage resolves to
    /// `on_abort()`.
    pub fn then<U, Fut, M, A>(self, f: M, on_abort: A) -> AbortableOperation<U>
    where
        U: Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
        M: FnOnce(T) -> Fut + Send + 'static,
        A: FnOnce() -> U + Send + 'static,
    {
        let AbortableOperation { future, handle } = self;
        AbortableOperation::guarded(
            handle.token.clone(),
            handle.aborted.clone(),
            async move { f(future.await).await },
            on_abort,
        )
    }
}

impl<T> Future for AbortableOperation<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.get_mut().future.poll_unpin(cx)
    }
}

impl<T> std::fmt::Debug for AbortableOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortableOperation")
            .field("aborted", &self.handle.is_aborted())
            .field("settled", &self.handle.is_settled())
            .finish()
    }
}
