//! Run an initialization routine exactly once across concurrent callers.
//!
//! The first caller of [OneShot::do_once] executes its action. Any caller that arrives
//! while the action is running waits for it to finish, and any caller that arrives
//! afterwards returns immediately. In every case, a return from [OneShot::do_once]
//! happens after the action's effects are complete.
//!
//! If the action panics, the [OneShot] is still considered done: later calls do not
//! retry it.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{once::OneShot, Runner, tokio};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let executor = tokio::Runner::default();
//! executor.start(|_| async move {
//!     let once = OneShot::new();
//!     let calls = AtomicUsize::new(0);
//!     for _ in 0..3 {
//!         once.do_once(|| {
//!             calls.fetch_add(1, Ordering::SeqCst);
//!         })
//!         .await;
//!     }
//!     assert_eq!(calls.load(Ordering::SeqCst), 1);
//! });
//! ```

use crate::utils::lock;
use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::sync::{Arc, Mutex};
use tracing::debug;

enum Phase {
    Unstarted,
    Running(Shared<oneshot::Receiver<()>>),
    Done,
}

/// A latch that runs a single action, no matter how many tasks invoke it.
///
/// Cloning a [OneShot] yields another reference to the same latch.
#[derive(Clone)]
pub struct OneShot {
    phase: Arc<Mutex<Phase>>,
}

impl Default for OneShot {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShot {
    /// Create a latch whose action has not yet run.
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase::Unstarted)),
        }
    }

    /// Run `action` if no action has run on this latch yet.
    ///
    /// Returns `true` if this call executed `action`. Callers that lose the race wait
    /// until the winning action has finished.
    pub async fn do_once<F: FnOnce()>(&self, action: F) -> bool {
        let entry = {
            let mut phase = lock(&self.phase);
            match &*phase {
                Phase::Done => None,
                Phase::Running(finished) => Some(Err(finished.clone())),
                Phase::Unstarted => {
                    let (sender, receiver) = oneshot::channel();
                    *phase = Phase::Running(receiver.shared());
                    Some(Ok(sender))
                }
            }
        };
        let sender = match entry {
            None => return false,
            Some(Err(finished)) => {
                // The sender is dropped (not used) if the action panics
                let _ = finished.await;
                return false;
            }
            Some(Ok(sender)) => sender,
        };

        // Marks the latch done even if the action unwinds
        let _finish = Finish {
            phase: &self.phase,
            sender: Some(sender),
        };
        debug!("running one-shot action");
        action();
        true
    }

    /// Returns `true` once an action has finished running.
    pub fn is_done(&self) -> bool {
        matches!(*lock(&self.phase), Phase::Done)
    }
}

struct Finish<'a> {
    phase: &'a Mutex<Phase>,
    sender: Option<oneshot::Sender<()>>,
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        *lock(self.phase) = Phase::Done;
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        }
    }
}
