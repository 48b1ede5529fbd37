pub mod execution;
pub mod models;
pub mod orchestration;
pub mod promise;
pub mod task_context;

pub use models::{CoreError, CoreErrorKind, Failure, Outcome, PromiseStatus};
pub use orchestration::{RunnerDelegate, Task, TaskRunner, TaskSource};
pub use promise::{Promise, Resolver};
