//! Wait for a known number of tasks to report completion.
//!
//! A [CompletionBarrier] holds a count of outstanding tasks. The count is raised with
//! [CompletionBarrier::add_expected] before the work starts and lowered with
//! [CompletionBarrier::signal_done] as each task finishes. Every call to
//! [CompletionBarrier::wait] blocks until the count reaches zero, at which point all
//! waiters are released together.
//!
//! Once released, a barrier must be [CompletionBarrier::reset] before it is used again.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{barrier::CompletionBarrier, Runner, Spawner, tokio};
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let barrier = CompletionBarrier::new();
//!
//!     // Hold the count open while tasks are still being registered
//!     let spawning = barrier.register();
//!     for _ in 0..3 {
//!         let token = barrier.register();
//!         context.clone().spawn(move |_| async move {
//!             // ... do some work ...
//!             drop(token);
//!         });
//!     }
//!     drop(spawning);
//!     barrier.wait().await;
//!     assert_eq!(barrier.outstanding(), 0);
//! });
//! ```

use crate::utils::{lock, Waiters};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

#[derive(Default)]
struct State {
    outstanding: usize,
    released: bool,
    waiters: Waiters,
}

impl State {
    fn release(&mut self) {
        self.released = true;
        self.waiters.wake_all();
    }
}

/// A counter that releases every waiter once all expected tasks have signaled completion.
///
/// Cloning a [CompletionBarrier] yields another reference to the same counter.
#[derive(Clone, Default)]
pub struct CompletionBarrier {
    state: Arc<Mutex<State>>,
}

impl CompletionBarrier {
    /// Create a barrier with no outstanding tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust the number of outstanding tasks by `delta`.
    ///
    /// If the count reaches zero, all waiters are released.
    ///
    /// # Panics
    ///
    /// Panics if the count would go negative, if `delta` is negative while waiters are
    /// blocked, or if the barrier has already released its waiters and was not reset.
    pub fn add_expected(&self, delta: isize) {
        let mut state = lock(&self.state);
        assert!(!state.released, "completion barrier reused without reset");
        if delta < 0 {
            assert!(
                state.waiters.is_empty(),
                "negative adjustment while waiters are blocked"
            );
        }
        let outstanding = state
            .outstanding
            .checked_add_signed(delta)
            .expect("completion barrier counter went negative");
        state.outstanding = outstanding;
        if outstanding == 0 && delta != 0 {
            state.release();
        }
    }

    /// Record that one outstanding task has finished.
    ///
    /// # Panics
    ///
    /// Panics if no task is outstanding.
    pub fn signal_done(&self) {
        let mut state = lock(&self.state);
        assert!(
            state.outstanding > 0,
            "completion barrier counter went negative"
        );
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.release();
        }
    }

    /// Expect one more task and return a [Token] that signals its completion when dropped.
    ///
    /// Because the token signals on drop, a task that panics still reports completion.
    ///
    /// When registering tasks in a loop, keep one token of your own until the loop is
    /// done: otherwise an early task may release the barrier before the next
    /// registration, which then panics.
    pub fn register(&self) -> Token {
        self.add_expected(1);
        Token {
            barrier: self.clone(),
        }
    }

    /// Wait until no task is outstanding.
    ///
    /// Completes immediately if the count is already zero.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            barrier: self,
            key: None,
        }
    }

    /// Rearm a released barrier so it can track a new batch of tasks.
    ///
    /// # Panics
    ///
    /// Panics if any task is outstanding or any waiter is blocked.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        assert!(
            state.outstanding == 0 && state.waiters.is_empty(),
            "reset of active completion barrier"
        );
        state.released = false;
    }

    /// Number of tasks that have not yet signaled completion.
    pub fn outstanding(&self) -> usize {
        lock(&self.state).outstanding
    }

    /// Returns `true` if the count has dropped to zero since the last reset.
    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }
}

/// Future returned by [CompletionBarrier::wait].
#[must_use = "futures do nothing unless polled"]
pub struct Wait<'a> {
    barrier: &'a CompletionBarrier,
    key: Option<u64>,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut state = lock(&this.barrier.state);
        if state.outstanding == 0 {
            state.waiters.remove(&mut this.key);
            return Poll::Ready(());
        }
        state.waiters.register(&mut this.key, cx.waker());
        Poll::Pending
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.key.is_some() {
            lock(&self.barrier.state).waiters.remove(&mut self.key);
        }
    }
}

/// Proof of an outstanding task, returned by [CompletionBarrier::register].
///
/// Dropping the token signals completion.
pub struct Token {
    barrier: CompletionBarrier,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.barrier.signal_done();
    }
}
