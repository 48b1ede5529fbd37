pub mod error;
pub mod failure;
pub mod status;

pub use error::{CoreError, CoreErrorKind};
pub use failure::Failure;
pub use status::{PromiseStatus, RunnerSnapshot};

pub type Outcome<T> = Result<T, Failure>;
