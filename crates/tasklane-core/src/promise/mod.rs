pub mod cancel;
pub mod combinators;

pub use cancel::{CancelToken, Cancelable, CancellationFlag, on_cancel};
pub use combinators::{join_all, join2, join3};

use std::error::Error;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::execution::{Executor, default_executor, tokio_executor};
use crate::models::{CoreError, CoreErrorKind, Failure, Outcome, PromiseStatus};

type Subscriber<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

/// Work that may hand back a cancelable handle for the operation it started.
pub type CancelableWork<T> =
    Box<dyn FnOnce(Resolver<T>) -> Outcome<Option<Box<dyn Cancelable>>> + Send>;

enum State<T> {
    Pending(Vec<Subscriber<T>>),
    Fulfilled(T),
    Rejected(Failure),
}

/// Forwarding target for cancel requests travelling up a derivation chain.
trait CancelNode: Send + Sync {
    fn request_cancel(&self);
}

struct Inner<T> {
    state: Mutex<State<T>>,
    token: CancelToken,
    links: Mutex<Vec<Weak<dyn CancelNode>>>,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
            token: CancelToken::new(),
            links: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let subscribers = {
            let mut state = self.lock_state();
            let State::Pending(subscribers) = &mut *state else {
                tracing::trace!("ignoring settlement of an already resolved promise");
                return false;
            };
            let subscribers = mem::take(subscribers);
            *state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(failure) => State::Rejected(failure.clone()),
            };
            subscribers
        };

        for subscriber in subscribers {
            subscriber(outcome.clone());
        }
        true
    }

    fn subscribe(&self, subscriber: Subscriber<T>) {
        let settled = {
            let mut state = self.lock_state();
            match &mut *state {
                State::Pending(subscribers) => {
                    subscribers.push(subscriber);
                    return;
                }
                State::Fulfilled(value) => Ok(value.clone()),
                State::Rejected(failure) => Err(failure.clone()),
            }
        };
        subscriber(settled);
    }

    fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.lock_state() {
            State::Pending(_) => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(failure) => Some(Err(failure.clone())),
        }
    }

    fn status(&self) -> PromiseStatus {
        match &*self.lock_state() {
            State::Pending(_) => PromiseStatus::Pending,
            State::Fulfilled(_) => PromiseStatus::Fulfilled,
            State::Rejected(_) => PromiseStatus::Rejected,
        }
    }

    fn link(&self, node: Weak<dyn CancelNode>) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.clone());

        if self.token.is_requested()
            && let Some(node) = node.upgrade()
        {
            node.request_cancel();
        }
    }
}

impl<T: Clone + Send + 'static> CancelNode for Inner<T> {
    fn request_cancel(&self) {
        if self.status().is_resolved() || !self.token.request() {
            return;
        }

        let links = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::debug!(links = links.len(), "promise cancellation requested");
        for link in links {
            if let Some(node) = link.upgrade() {
                node.request_cancel();
            }
        }
    }
}

enum Step<T> {
    Value(T),
    Adopt(Promise<T>),
}

/// The settling side of a promise.
///
/// Only the first `fulfill`/`reject`/`settle` call on any clone has an effect.
pub struct Resolver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    pub fn fulfill(&self, value: T) -> bool {
        self.inner.settle(Ok(value))
    }

    pub fn reject(&self, error: impl Into<Failure>) -> bool {
        self.inner.settle(Err(error.into()))
    }

    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        self.inner.settle(outcome)
    }

    /// Whether cancellation was requested on the promise this resolver settles.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_requested()
    }

    /// Attaches the handle that a cancel request on this resolver's promise
    /// should reach. A request made earlier cancels the handle right away.
    pub fn bind_cancelable(&self, handle: Arc<dyn Cancelable>) {
        self.inner.token.bind(handle);
    }

    /// Settles with `source`'s outcome. The settlement is handed to `executor`
    /// so chains of adopted promises unwind instead of nesting on one stack.
    fn adopt(&self, source: &Promise<T>, executor: Arc<dyn Executor>) {
        self.inner.link(source.cancel_node());
        let resolver = self.clone();
        source
            .inner
            .subscribe(Box::new(move |outcome| {
                executor.execute(Box::new(move || {
                    resolver.settle(outcome);
                }));
            }));
    }
}

/// The eventual result of an asynchronous operation.
///
/// Cloning a `Promise` clones the handle, not the computation. Every derived
/// promise (`then`, `catch`, `recover`, `always`, ...) schedules its callback
/// on the executor of the handle it was derived from and forwards cancel
/// requests back to that handle.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
    executor: Arc<dyn Executor>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A pending promise together with the resolver that settles it.
    pub fn pending() -> (Self, Resolver<T>) {
        Self::pending_on(default_executor())
    }

    pub fn pending_on(executor: Arc<dyn Executor>) -> (Self, Resolver<T>) {
        let inner = Arc::new(Inner::new());
        let resolver = Resolver {
            inner: inner.clone(),
        };
        (Self { inner, executor }, resolver)
    }

    pub fn new<W>(work: W) -> Self
    where
        W: FnOnce(Resolver<T>) -> Outcome<()> + Send + 'static,
    {
        Self::new_on(default_executor(), work)
    }

    pub fn new_on<W>(executor: Arc<dyn Executor>, work: W) -> Self
    where
        W: FnOnce(Resolver<T>) -> Outcome<()> + Send + 'static,
    {
        Self::cancelable_on(executor, move |resolver| work(resolver).map(|()| None))
    }

    pub fn cancelable<W>(work: W) -> Self
    where
        W: FnOnce(Resolver<T>) -> Outcome<Option<Box<dyn Cancelable>>> + Send + 'static,
    {
        Self::cancelable_on(default_executor(), work)
    }

    /// Schedules `work` on `executor`.
    ///
    /// Work never runs if cancellation was requested before it was scheduled
    /// to start; the promise rejects with `Cancelled` instead. An `Err` or a
    /// panic from `work` rejects the promise.
    pub fn cancelable_on<W>(executor: Arc<dyn Executor>, work: W) -> Self
    where
        W: FnOnce(Resolver<T>) -> Outcome<Option<Box<dyn Cancelable>>> + Send + 'static,
    {
        let (promise, resolver) = Self::pending_on(executor.clone());
        let inner = promise.inner.clone();
        let work: CancelableWork<T> = Box::new(work);

        executor.execute(Box::new(move || {
            if inner.token.is_requested() {
                tracing::debug!("skipping promise work cancelled before it started");
                resolver.reject(CoreError::cancelled(
                    "promise cancelled before its work started",
                ));
                return;
            }

            match catch_unwind(AssertUnwindSafe(|| work(resolver.clone()))) {
                Ok(Ok(Some(handle))) => inner.token.bind(Arc::from(handle)),
                Ok(Ok(None)) => {}
                Ok(Err(failure)) => {
                    resolver.reject(failure);
                }
                Err(payload) => {
                    resolver.reject(Failure::from_panic(payload));
                }
            }
        }));

        promise
    }

    /// Runs `future` on tokio. Cancelling the promise drops the future and
    /// rejects with `Cancelled`.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::cancelable(move |resolver| {
            let handle = tokio_executor::runtime_handle().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    "no tokio runtime available to spawn promise future",
                )
            })?;

            let flag = CancellationFlag::new();
            let watch = flag.clone();
            let task = handle.spawn(async move {
                tokio::select! {
                    biased;
                    _ = watch.cancelled() => Err(CoreError::cancelled("spawned future cancelled").into()),
                    outcome = future => outcome,
                }
            });

            handle.spawn(async move {
                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(join_error) if join_error.is_panic() => {
                        Err(Failure::from_panic(join_error.into_panic()))
                    }
                    Err(join_error) => Err(CoreError::cancelled(format!(
                        "spawned future aborted: {join_error}"
                    ))
                    .into()),
                };
                resolver.settle(outcome);
            });

            Ok(Some(Box::new(flag) as Box<dyn Cancelable>))
        })
    }

    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.fulfill(value);
        promise
    }

    pub fn rejected(error: impl Into<Failure>) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.reject(error);
        promise
    }

    /// The same promise, deriving future continuations on `executor`.
    pub fn on(&self, executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: self.inner.clone(),
            executor,
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn status(&self) -> PromiseStatus {
        self.inner.status()
    }

    pub fn is_resolved(&self) -> bool {
        self.status().is_resolved()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_requested()
    }

    /// The settled outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.inner.outcome()
    }

    /// Waits for the promise to settle.
    pub async fn wait(&self) -> Outcome<T> {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.inner.subscribe(Box::new(move |outcome| {
            let _ = sender.send(outcome);
        }));
        receiver.await.unwrap_or_else(|_| {
            Err(CoreError::new(CoreErrorKind::Internal, "promise dropped before settling").into())
        })
    }

    /// Requests cancellation of this promise and, through the derivation
    /// chain, of the operation at its root. No-op once resolved.
    pub fn cancel(&self) {
        self.inner.request_cancel();
    }

    pub fn then<U, F>(&self, continuation: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        self.derive(move |outcome| continuation(outcome?).map(Step::Value))
    }

    /// Like [`Promise::then`], for continuations that start further asynchronous work.
    pub fn and_then<U, F>(&self, continuation: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<Promise<U>> + Send + 'static,
    {
        self.derive(move |outcome| continuation(outcome?).map(Step::Adopt))
    }

    /// Observes a rejection. The handler may return `Err` to replace the
    /// error; the derived promise rejects either way.
    pub fn catch<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(&Failure) -> Outcome<()> + Send + 'static,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Ok(Step::Value(value)),
            Err(failure) => Err(handler(&failure).err().unwrap_or(failure)),
        })
    }

    /// [`Promise::catch`] restricted to rejections whose error is an `E`.
    pub fn catch_type<E, F>(&self, handler: F) -> Promise<T>
    where
        E: Error + 'static,
        F: FnOnce(&E) -> Outcome<()> + Send + 'static,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Ok(Step::Value(value)),
            Err(failure) => {
                let replaced = failure
                    .downcast_ref::<E>()
                    .and_then(|typed| handler(typed).err());
                Err(replaced.unwrap_or(failure))
            }
        })
    }

    pub fn recover<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(Failure) -> Outcome<T> + Send + 'static,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Ok(Step::Value(value)),
            Err(failure) => handler(failure).map(Step::Value),
        })
    }

    pub fn recover_with<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(Failure) -> Outcome<Promise<T>> + Send + 'static,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Ok(Step::Value(value)),
            Err(failure) => handler(failure).map(Step::Adopt),
        })
    }

    /// Recovers only rejections whose error is an `E`; others pass through unchanged.
    pub fn recover_type<E, F>(&self, handler: F) -> Promise<T>
    where
        E: Error + 'static,
        F: FnOnce(&E) -> Outcome<T> + Send + 'static,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Ok(Step::Value(value)),
            Err(failure) => {
                let recovered = failure.downcast_ref::<E>().map(handler);
                match recovered {
                    Some(recovered) => recovered.map(Step::Value),
                    None => Err(failure),
                }
            }
        })
    }

    pub fn recover_type_with<E, F>(&self, handler: F) -> Promise<T>
    where
        E: Error + 'static,
        F: FnOnce(&E) -> Outcome<Promise<T>> + Send + 'static,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Ok(Step::Value(value)),
            Err(failure) => {
                let recovered = failure.downcast_ref::<E>().map(handler);
                match recovered {
                    Some(recovered) => recovered.map(Step::Adopt),
                    None => Err(failure),
                }
            }
        })
    }

    /// Runs `callback` once the promise settles either way. The outcome passes
    /// through untouched, even if `callback` panics.
    pub fn always<F>(&self, callback: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.derive(move |outcome| {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::error!("promise `always` callback panicked");
            }
            outcome.map(Step::Value)
        })
    }

    /// Hands the outcome to `callback` once settled, without deriving a promise.
    pub fn on_settle<F>(&self, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let executor = self.executor.clone();
        self.inner.subscribe(Box::new(move |outcome| {
            executor.execute(Box::new(move || {
                if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
                    tracing::error!("promise settle observer panicked");
                }
            }));
        }));
    }

    fn cancel_node(&self) -> Weak<dyn CancelNode> {
        let node: Arc<dyn CancelNode> = self.inner.clone();
        Arc::downgrade(&node)
    }

    fn derive<U, F>(&self, continuation: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<Step<U>> + Send + 'static,
    {
        let (derived, resolver) = Promise::<U>::pending_on(self.executor.clone());
        derived.inner.link(self.cancel_node());

        let executor = self.executor.clone();
        self.inner.subscribe(Box::new(move |outcome| {
            let forward = executor.clone();
            executor.execute(Box::new(move || {
                let step = catch_unwind(AssertUnwindSafe(move || continuation(outcome)))
                    .unwrap_or_else(|payload| Err(Failure::from_panic(payload)));
                match step {
                    Ok(Step::Value(value)) => {
                        resolver.fulfill(value);
                    }
                    Ok(Step::Adopt(source)) => resolver.adopt(&source, forward),
                    Err(failure) => {
                        resolver.reject(failure);
                    }
                }
            }));
        }));

        derived
    }
}

impl<T: Clone + Send + 'static> Cancelable for Promise<T> {
    fn cancel(&self) {
        Promise::cancel(self);
    }
}

impl<T: Clone + Send + 'static> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .field("cancel_handle", &self.inner.token.handle().is_some())
            .field("executor", &self.executor.label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{Promise, on_cancel};
    use crate::execution::{Executor, ImmediateExecutor};
    use crate::models::{CoreErrorKind, Failure, PromiseStatus};

    fn immediate() -> Arc<dyn Executor> {
        Arc::new(ImmediateExecutor)
    }

    #[test]
    fn first_settlement_wins() {
        let (promise, resolver) = Promise::<u32>::pending_on(immediate());
        assert!(resolver.fulfill(1));
        assert!(!resolver.fulfill(2));
        assert!(!resolver.reject(Failure::msg("late")));

        assert_eq!(promise.status(), PromiseStatus::Fulfilled);
        assert_eq!(promise.outcome().unwrap().unwrap(), 1);
    }

    #[test]
    fn work_errors_reject_the_promise() {
        let promise = Promise::<u32>::new_on(immediate(), |_| Err(Failure::msg("sync failure")));
        let failure = promise.outcome().unwrap().unwrap_err();
        assert_eq!(failure.to_string(), "sync failure");
    }

    #[test]
    fn panicking_continuation_rejects_derived_promise() {
        let promise = Promise::resolved(3_u32).on(immediate());
        let derived = promise.then(|_| -> Result<u32, Failure> { panic!("bad continuation") });
        let failure = derived.outcome().unwrap().unwrap_err();
        assert_eq!(failure.kind(), Some(CoreErrorKind::Panicked));
    }

    #[test]
    fn continuations_attached_after_settlement_still_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let promise = Promise::resolved(5_u32).on(immediate());
        promise.always({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_on_resolved_promise_is_ignored() {
        let promise = Promise::resolved(()).on(immediate());
        promise.cancel();
        assert!(!promise.is_cancelled());
        assert_eq!(promise.status(), PromiseStatus::Fulfilled);
    }

    #[test]
    fn debug_output_reports_status() {
        let (promise, _resolver) = Promise::<()>::pending_on(immediate());
        let rendered = format!("{promise:?}");
        assert!(rendered.contains("Pending"));
        assert!(rendered.contains("immediate"));
        assert!(rendered.contains("cancel_handle: false"));
    }

    #[test]
    fn bound_cancelable_receives_cancel_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (promise, resolver) = Promise::<()>::pending_on(immediate());
        resolver.bind_cancelable(Arc::from(on_cancel({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })));
        assert!(format!("{promise:?}").contains("cancel_handle: true"));

        promise.cancel();
        promise.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resolver.is_cancelled());
    }
}
