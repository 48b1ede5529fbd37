use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::execution::{Executor, Job};

const BACKGROUND_THREAD_NAME: &str = "tasklane-promises";
const BACKGROUND_WORKERS: usize = 2;

/// Schedules jobs onto a specific tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    label: String,
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(label: impl Into<String>, handle: Handle) -> Self {
        Self {
            label: label.into(),
            handle,
        }
    }

    /// Binds to the runtime the caller is currently running inside, if any.
    pub fn current(label: impl Into<String>) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::new(label, handle))
    }
}

impl Executor for TokioExecutor {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

/// The default executor.
///
/// Each job goes to the tokio runtime active on the scheduling thread. Jobs
/// scheduled from outside any runtime go to a lazily started background
/// runtime, or to a dedicated thread if that runtime could not be built.
#[derive(Clone, Copy, Debug, Default)]
pub struct AmbientExecutor;

impl Executor for AmbientExecutor {
    fn label(&self) -> &str {
        "ambient"
    }

    fn execute(&self, job: Job) {
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move { job() });
            return;
        }

        match background_runtime() {
            Some(runtime) => {
                runtime.spawn(async move { job() });
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name(BACKGROUND_THREAD_NAME.to_string())
                    .spawn(job);
                if let Err(error) = spawned {
                    tracing::error!(%error, "failed to spawn promise job thread");
                }
            }
        }
    }
}

/// A runtime handle for spawning futures: the current runtime if there is
/// one, otherwise the shared background runtime.
pub(crate) fn runtime_handle() -> Option<Handle> {
    Handle::try_current()
        .ok()
        .or_else(|| background_runtime().map(|runtime| runtime.handle().clone()))
}

fn background_runtime() -> Option<&'static Runtime> {
    static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            match Builder::new_multi_thread()
                .worker_threads(BACKGROUND_WORKERS)
                .thread_name(BACKGROUND_THREAD_NAME)
                .enable_all()
                .build()
            {
                Ok(runtime) => Some(runtime),
                Err(error) => {
                    tracing::error!(%error, "failed to build background promise runtime");
                    None
                }
            }
        })
        .as_ref()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::{AmbientExecutor, TokioExecutor};
    use crate::execution::Executor;

    #[test]
    fn ambient_executor_runs_jobs_outside_a_runtime() {
        let (sender, receiver) = mpsc::channel();
        AmbientExecutor.execute(Box::new(move || {
            let _ = sender.send(std::thread::current().name().map(str::to_string));
        }));

        let thread_name = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("job should run on the background runtime");
        assert_eq!(thread_name.as_deref(), Some("tasklane-promises"));
    }

    #[tokio::test]
    async fn tokio_executor_spawns_on_the_bound_runtime() {
        let executor = TokioExecutor::current("test").expect("inside a runtime");
        let (sender, receiver) = tokio::sync::oneshot::channel();
        executor.execute(Box::new(move || {
            let _ = sender.send(7);
        }));
        assert_eq!(receiver.await.unwrap(), 7);
        assert_eq!(executor.label(), "test");
    }
}
