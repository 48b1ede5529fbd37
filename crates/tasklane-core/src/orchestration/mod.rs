pub mod block_task;
pub mod in_memory;
pub mod runner;

pub use block_task::BlockTask;
pub use in_memory::{InMemoryTaskSource, RescueHandler};
pub use runner::TaskRunner;

use std::sync::Arc;

use crate::models::{CoreError, CoreErrorKind, Failure};
use crate::promise::Promise;

/// A named unit of asynchronous work.
pub trait Task: Send + Sync {
    fn id(&self) -> &str;

    fn run(&self) -> Promise<()>;
}

/// Called exactly once by [`TaskSource::rescue`]: `None` when the rescue
/// succeeded, otherwise the error that ended it.
pub type RescueCompletion = Box<dyn FnOnce(Option<Failure>) + Send>;

/// Supplies tasks and per-task failure policy to a [`TaskRunner`].
///
/// Any bookkeeping about tasks (rescue attempts, retried state) belongs to
/// the source; the runner only keeps a cursor.
pub trait TaskSource: Send + Sync {
    fn task_count(&self) -> usize;

    fn task_at(&self, index: usize) -> Arc<dyn Task>;

    fn can_rescue(&self, _index: usize, _error: &Failure) -> bool {
        false
    }

    fn rescue(&self, index: usize, completion: RescueCompletion) {
        completion(Some(
            CoreError::new(
                CoreErrorKind::Internal,
                format!("task source does not implement rescue for task {index}"),
            )
            .into(),
        ));
    }

    fn is_required(&self, _index: usize) -> bool {
        true
    }
}

/// Progress notifications from a [`TaskRunner`].
pub trait RunnerDelegate: Send + Sync {
    fn will_start(&self) {}

    fn will_resume(&self) {}

    fn will_run_task(&self, _index: usize) {}

    fn task_finished(&self, _index: usize, _error: Option<&Failure>) {}

    fn run_stopped(&self, _index: usize, _error: &Failure) {}

    fn run_finished(&self, _error: Option<&Failure>) {}
}
