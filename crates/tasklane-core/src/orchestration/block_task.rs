use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::orchestration::Task;
use crate::promise::Promise;

type Block = Box<dyn Fn() -> Promise<()> + Send + Sync>;

/// A [`Task`] backed by a closure.
///
/// With `preserve_result` enabled the first promise the closure produced is
/// cached and returned by every later `run` until [`BlockTask::flush`] is
/// called, so re-running a finished sequence does not repeat the work.
pub struct BlockTask {
    id: String,
    block: Block,
    preserve_result: AtomicBool,
    preserved: Mutex<Option<Promise<()>>>,
}

impl BlockTask {
    pub fn new<F>(id: impl Into<String>, block: F) -> Self
    where
        F: Fn() -> Promise<()> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            block: Box::new(block),
            preserve_result: AtomicBool::new(false),
            preserved: Mutex::new(None),
        }
    }

    pub fn preserve_result(self, preserve: bool) -> Self {
        self.set_preserve_result(preserve);
        self
    }

    pub fn set_preserve_result(&self, preserve: bool) {
        self.preserve_result.store(preserve, Ordering::SeqCst);
    }

    pub fn preserves_result(&self) -> bool {
        self.preserve_result.load(Ordering::SeqCst)
    }

    pub fn flush(&self) {
        self.preserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Task for BlockTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self) -> Promise<()> {
        if !self.preserves_result() {
            return (self.block)();
        }

        let mut preserved = self
            .preserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        preserved.get_or_insert_with(|| (self.block)()).clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::BlockTask;
    use crate::orchestration::Task;
    use crate::promise::Promise;

    fn counting_task(calls: &Arc<AtomicUsize>) -> BlockTask {
        let calls = calls.clone();
        BlockTask::new("count", move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Promise::resolved(())
        })
    }

    #[test]
    fn runs_block_every_time_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&calls);
        task.run();
        task.run();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(task.id(), "count");
    }

    #[test]
    fn preserved_result_is_reused_until_flushed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&calls).preserve_result(true);

        task.run();
        task.run();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        task.flush();
        task.run();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
