use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tasklane_core::execution::{
    Executor, Job, default_executor, reset_default_executor, set_default_executor,
};
use tasklane_core::promise::Promise;

struct CountingExecutor {
    jobs: AtomicUsize,
}

impl Executor for CountingExecutor {
    fn label(&self) -> &str {
        "counting"
    }

    fn execute(&self, job: Job) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        job();
    }
}

#[test]
fn process_wide_default_can_be_replaced_and_reset() {
    let counting = Arc::new(CountingExecutor {
        jobs: AtomicUsize::new(0),
    });
    set_default_executor(counting.clone());
    assert_eq!(default_executor().label(), "counting");

    let promise = Promise::new(|resolver| {
        resolver.fulfill(2_u32);
        Ok(())
    })
    .then(|value| Ok(value * 2));

    assert_eq!(promise.outcome().unwrap().unwrap(), 4);
    assert_eq!(promise.executor().label(), "counting");
    assert_eq!(counting.jobs.load(Ordering::SeqCst), 2);

    reset_default_executor();
    assert_eq!(default_executor().label(), "ambient");
}
