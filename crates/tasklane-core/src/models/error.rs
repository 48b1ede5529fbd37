use std::any::Any;

use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    Cancelled,
    NoTaskSource,
    Panicked,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<String>,
    pub index: Option<usize>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            index: None,
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Cancelled, message)
    }

    pub fn no_task_source() -> Self {
        Self::new(
            CoreErrorKind::NoTaskSource,
            "task runner has no task source attached",
        )
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "callback panicked".to_string()
        };
        Self::new(CoreErrorKind::Panicked, detail)
    }

    pub fn at_task(mut self, index: usize, task: impl Into<String>) -> Self {
        self.index = Some(index);
        self.task = Some(task.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreError, CoreErrorKind};

    #[test]
    fn display_includes_kind_and_message() {
        let error = CoreError::cancelled("stopped early");
        assert_eq!(error.to_string(), "Cancelled: stopped early");
    }

    #[test]
    fn task_attribution_is_recorded() {
        let error = CoreError::new(CoreErrorKind::Panicked, "boom").at_task(2, "migrate");
        assert_eq!(error.index, Some(2));
        assert_eq!(error.task.as_deref(), Some("migrate"));
    }
}
