use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::Failure;
use crate::orchestration::{RescueCompletion, Task, TaskSource};
use crate::promise::Promise;

/// Attempts to repair the conditions that made the task at `index` fail.
pub type RescueHandler = Arc<dyn Fn(usize) -> Promise<()> + Send + Sync>;

const DEFAULT_MAX_RESCUES: usize = 1;

struct TaskEntry {
    task: Arc<dyn Task>,
    required: bool,
    rescue: Option<RescueHandler>,
    rescues: usize,
}

/// A [`TaskSource`] over a fixed list of tasks.
///
/// Each task may carry a rescue handler; a task is rescued at most
/// `max_rescues` times before its failures are treated as final.
pub struct InMemoryTaskSource {
    entries: Mutex<Vec<TaskEntry>>,
    max_rescues: usize,
}

impl Default for InMemoryTaskSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskSource {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_rescues: DEFAULT_MAX_RESCUES,
        }
    }

    pub fn with_max_rescues(mut self, max_rescues: usize) -> Self {
        self.max_rescues = max_rescues;
        self
    }

    pub fn push(self, task: impl Task + 'static) -> Self {
        self.add_task(Arc::new(task), true);
        self
    }

    /// Adds a task whose failure does not stop the run.
    pub fn push_optional(self, task: impl Task + 'static) -> Self {
        self.add_task(Arc::new(task), false);
        self
    }

    /// Attaches a rescue handler to the most recently added task.
    pub fn rescued_by<F>(self, handler: F) -> Self
    where
        F: Fn(usize) -> Promise<()> + Send + Sync + 'static,
    {
        if let Some(entry) = self.lock_entries().last_mut() {
            entry.rescue = Some(Arc::new(handler));
        }
        self
    }

    pub fn add_task(&self, task: Arc<dyn Task>, required: bool) {
        self.lock_entries().push(TaskEntry {
            task,
            required,
            rescue: None,
            rescues: 0,
        });
    }

    pub fn set_required(&self, index: usize, required: bool) {
        if let Some(entry) = self.lock_entries().get_mut(index) {
            entry.required = required;
        }
    }

    pub fn rescue_count(&self, index: usize) -> usize {
        self.lock_entries()
            .get(index)
            .map_or(0, |entry| entry.rescues)
    }

    pub fn reset_rescues(&self) {
        for entry in self.lock_entries().iter_mut() {
            entry.rescues = 0;
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<TaskEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskSource for InMemoryTaskSource {
    fn task_count(&self) -> usize {
        self.lock_entries().len()
    }

    fn task_at(&self, index: usize) -> Arc<dyn Task> {
        self.lock_entries()[index].task.clone()
    }

    fn can_rescue(&self, index: usize, _error: &Failure) -> bool {
        self.lock_entries()
            .get(index)
            .is_some_and(|entry| entry.rescue.is_some() && entry.rescues < self.max_rescues)
    }

    fn rescue(&self, index: usize, completion: RescueCompletion) {
        let handler = {
            let mut entries = self.lock_entries();
            entries.get_mut(index).and_then(|entry| {
                entry.rescues += 1;
                entry.rescue.clone()
            })
        };

        let Some(handler) = handler else {
            completion(Some(Failure::msg(format!(
                "no rescue handler registered for task {index}"
            ))));
            return;
        };

        tracing::debug!(index, attempt = self.rescue_count(index), "rescuing task");
        handler(index).on_settle(move |outcome| completion(outcome.err()));
    }

    fn is_required(&self, index: usize) -> bool {
        self.lock_entries()
            .get(index)
            .is_none_or(|entry| entry.required)
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryTaskSource;
    use crate::models::Failure;
    use crate::orchestration::{BlockTask, TaskSource};
    use crate::promise::Promise;

    fn ok_task(id: &str) -> BlockTask {
        BlockTask::new(id, || Promise::resolved(()))
    }

    #[test]
    fn builder_records_policy_per_task() {
        let source = InMemoryTaskSource::new()
            .push(ok_task("a"))
            .push_optional(ok_task("b"))
            .rescued_by(|_| Promise::resolved(()));

        assert_eq!(source.task_count(), 2);
        assert_eq!(source.task_at(1).id(), "b");
        assert!(source.is_required(0));
        assert!(!source.is_required(1));
        assert!(source.is_required(7));

        let failure = Failure::msg("x");
        assert!(!source.can_rescue(0, &failure));
        assert!(source.can_rescue(1, &failure));
    }

    #[test]
    fn rescue_budget_is_tracked_by_the_source() {
        let source = InMemoryTaskSource::new()
            .with_max_rescues(1)
            .push(ok_task("a"))
            .rescued_by(|_| Promise::resolved(()));
        let failure = Failure::msg("x");

        source.rescue(0, Box::new(|_| {}));
        assert_eq!(source.rescue_count(0), 1);
        assert!(!source.can_rescue(0, &failure));

        source.reset_rescues();
        assert!(source.can_rescue(0, &failure));
    }
}
