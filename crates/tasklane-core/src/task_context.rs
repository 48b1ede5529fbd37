use std::cell::RefCell;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskScope {
    pub index: usize,
    pub id: String,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskScope>> = const { RefCell::new(None) };
}

/// The task whose unit of work is being started on this thread, if any.
///
/// Only set while `Task::run` itself executes; continuations the task chains
/// later run outside the scope.
pub fn current_task() -> Option<TaskScope> {
    CURRENT_TASK.with(|slot| slot.borrow().clone())
}

pub(crate) fn with_task<R>(scope: TaskScope, operation: impl FnOnce() -> R) -> R {
    struct Restore(Option<TaskScope>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT_TASK.with(|slot| *slot.borrow_mut() = previous);
        }
    }

    let _restore = Restore(CURRENT_TASK.with(|slot| slot.borrow_mut().replace(scope)));
    operation()
}
