pub mod tokio_executor;

pub use tokio_executor::{AmbientExecutor, TokioExecutor};

use std::sync::{Arc, PoisonError, RwLock};

/// A unit of scheduled work: one promise continuation or one root work closure.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named execution context that promise continuations are scheduled on.
pub trait Executor: Send + Sync {
    fn label(&self) -> &str;

    fn execute(&self, job: Job);
}

/// Runs every job inline on the thread that schedules it.
///
/// Continuations then fire on the stack of whoever settles the promise (or
/// attaches to an already settled one), which makes chains fully
/// deterministic. Intended for tests and for callers that provide their own
/// outer scheduling.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn label(&self) -> &str {
        "immediate"
    }

    fn execute(&self, job: Job) {
        job();
    }
}

static DEFAULT_EXECUTOR: RwLock<Option<Arc<dyn Executor>>> = RwLock::new(None);

/// The process-wide executor used when no explicit one is supplied.
pub fn default_executor() -> Arc<dyn Executor> {
    let configured = DEFAULT_EXECUTOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    configured.unwrap_or_else(|| Arc::new(AmbientExecutor))
}

pub fn set_default_executor(executor: Arc<dyn Executor>) {
    tracing::debug!(label = executor.label(), "replacing default promise executor");
    *DEFAULT_EXECUTOR
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(executor);
}

pub fn reset_default_executor() {
    *DEFAULT_EXECUTOR
        .write()
        .unwrap_or_else(PoisonError::into_inner) = None;
}
