use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

/// Handle to an in-progress asynchronous operation that can be asked to stop.
///
/// Cancellation is advisory: the operation is expected to notice the request
/// and settle its promise (usually with a `Cancelled` error) on its own.
pub trait Cancelable: Send + Sync {
    fn cancel(&self);
}

impl Cancelable for AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

impl<T: Send + 'static> Cancelable for JoinHandle<T> {
    fn cancel(&self) {
        self.abort();
    }
}

/// Wraps a closure that runs at most once, on the first cancel request.
pub fn on_cancel<F>(action: F) -> Box<dyn Cancelable>
where
    F: FnOnce() + Send + 'static,
{
    Box::new(OnCancel {
        action: Mutex::new(Some(Box::new(action))),
    })
}

struct OnCancel {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Cancelable for OnCancel {
    fn cancel(&self) {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
    }
}

/// A shareable cancellation flag that work can poll or await.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`Cancelable::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Cancelable for CancellationFlag {
    fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }
}

enum CancelState {
    NotYetBound,
    Bound(Arc<dyn Cancelable>),
    CancelRequested,
    CancelRequestedAndBound(Arc<dyn Cancelable>),
}

/// Tracks the cancelable handle of one operation.
///
/// The handle may be attached after cancellation was already requested (the
/// work producing it runs later than the caller holding the promise); in that
/// case it is canceled the moment it is bound. Every bound handle receives at
/// most one cancel call.
pub struct CancelToken {
    state: Mutex<CancelState>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CancelState::NotYetBound),
        }
    }

    pub fn bind(&self, handle: Arc<dyn Cancelable>) {
        let cancel_now = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match mem::replace(&mut *state, CancelState::NotYetBound) {
                CancelState::NotYetBound | CancelState::Bound(_) => {
                    *state = CancelState::Bound(handle);
                    None
                }
                CancelState::CancelRequested | CancelState::CancelRequestedAndBound(_) => {
                    *state = CancelState::CancelRequestedAndBound(handle.clone());
                    Some(handle)
                }
            }
        };

        if let Some(handle) = cancel_now {
            handle.cancel();
        }
    }

    /// Records a cancel request. Returns `false` if one was already recorded.
    pub fn request(&self) -> bool {
        let cancel_now = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match mem::replace(&mut *state, CancelState::NotYetBound) {
                CancelState::NotYetBound => {
                    *state = CancelState::CancelRequested;
                    None
                }
                CancelState::Bound(handle) => {
                    *state = CancelState::CancelRequestedAndBound(handle.clone());
                    Some(handle)
                }
                requested @ (CancelState::CancelRequested
                | CancelState::CancelRequestedAndBound(_)) => {
                    *state = requested;
                    return false;
                }
            }
        };

        if let Some(handle) = cancel_now {
            handle.cancel();
        }
        true
    }

    /// The bound handle, kept after a cancel request so it outlives the request.
    pub fn handle(&self) -> Option<Arc<dyn Cancelable>> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            CancelState::Bound(handle) | CancelState::CancelRequestedAndBound(handle) => {
                Some(handle.clone())
            }
            CancelState::NotYetBound | CancelState::CancelRequested => None,
        }
    }

    pub fn is_requested(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            CancelState::CancelRequested | CancelState::CancelRequestedAndBound(_)
        )
    }
}
