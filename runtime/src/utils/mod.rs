//! Utility functions for interacting with any runtime.

use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

mod handle;
pub(crate) use handle::recover;
pub use handle::Handle;

/// Yield control back to the runtime.
pub async fn reschedule() {
    struct Reschedule {
        yielded: bool,
    }

    impl Future for Reschedule {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    Reschedule { yielded: false }.await
}

pub(crate) fn extract_panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{err:?}")
    }
}

/// Acquire `mutex`, ignoring poison.
///
/// Usage errors are raised with the lock held but before any state is mutated, so
/// the protected state stays consistent for the drop handlers that run afterwards.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tasks parked on a shared state change.
///
/// Each parked future holds a key (initially `None`) that identifies its slot. A
/// registration stays in place until it is explicitly removed, even if it has
/// already been woken and not yet re-polled.
#[derive(Default)]
pub(crate) struct Waiters {
    next: u64,
    wakers: HashMap<u64, Waker>,
}

impl Waiters {
    /// Park (or refresh) the waker stored under `key`, assigning a key if needed.
    ///
    /// Returns `true` if this is a new registration.
    pub(crate) fn register(&mut self, key: &mut Option<u64>, waker: &Waker) -> bool {
        match key {
            Some(existing) => {
                match self.wakers.get_mut(existing) {
                    Some(stored) if stored.will_wake(waker) => {}
                    Some(stored) => *stored = waker.clone(),
                    None => {
                        self.wakers.insert(*existing, waker.clone());
                    }
                }
                false
            }
            None => {
                let assigned = self.next;
                self.next += 1;
                self.wakers.insert(assigned, waker.clone());
                *key = Some(assigned);
                true
            }
        }
    }

    /// Remove the registration stored under `key` (if any).
    pub(crate) fn remove(&mut self, key: &mut Option<u64>) {
        if let Some(existing) = key.take() {
            self.wakers.remove(&existing);
        }
    }

    /// Number of parked futures.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    /// Returns `true` if nothing is parked.
    pub(crate) fn is_empty(&self) -> bool {
        self.wakers.is_empty()
    }

    /// Wake every parked future without removing it.
    pub(crate) fn wake_all(&self) {
        for waker in self.wakers.values() {
            waker.wake_by_ref();
        }
    }
}
