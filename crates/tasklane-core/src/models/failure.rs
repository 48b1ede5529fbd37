use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::models::{CoreError, CoreErrorKind};

/// The error a promise rejects with.
///
/// A `Failure` is a shared handle around any `std::error::Error`, so one
/// rejection can be observed by every continuation attached to a promise.
/// Typed handlers narrow it with [`Failure::downcast_ref`]; a handler whose
/// type does not match never sees the failure and it propagates unchanged.
///
/// `Failure` does not implement `Error`, so `?` converts any error into it.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn Error + Send + Sync + 'static>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl Failure {
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::new(CoreError::from_panic(payload.as_ref()))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Error + 'static,
    {
        (*self.inner).downcast_ref::<E>()
    }

    pub fn is<E>(&self) -> bool
    where
        E: Error + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Kind of the wrapped error when it is one of this crate's own.
    pub fn kind(&self) -> Option<CoreErrorKind> {
        self.downcast_ref::<CoreError>().map(|error| error.kind)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == Some(CoreErrorKind::Cancelled)
    }

    /// True when both handles point at the same underlying error value.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }
}

impl<E> From<E> for Failure
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.inner, f)
    }
}

impl Debug for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::Failure;
    use crate::models::{CoreError, CoreErrorKind};

    #[test]
    fn downcast_matches_only_the_wrapped_type() {
        let failure = Failure::from(io::Error::other("disk"));
        assert!(failure.is::<io::Error>());
        assert!(!failure.is::<CoreError>());
        assert_eq!(failure.kind(), None);
    }

    #[test]
    fn clones_share_the_same_error() {
        let failure = Failure::new(CoreError::cancelled("stop"));
        let copy = failure.clone();
        assert!(failure.ptr_eq(&copy));
        assert!(!failure.ptr_eq(&Failure::new(CoreError::cancelled("stop"))));
        assert!(copy.is_cancelled());
    }

    #[test]
    fn panic_payloads_become_panicked_errors() {
        let payload = std::panic::catch_unwind(|| panic!("exploded")).unwrap_err();
        let failure = Failure::from_panic(payload);
        assert_eq!(failure.kind(), Some(CoreErrorKind::Panicked));
        assert_eq!(failure.to_string(), "Panicked: exploded");
    }

    #[test]
    fn messages_display_verbatim() {
        assert_eq!(Failure::msg("plain text").to_string(), "plain text");
    }
}
