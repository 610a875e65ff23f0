//! Shared state whose every access is mediated by a lock.
//!
//! A [GuardedState] can only be touched through a closure that runs while the lock
//! is held, so there is no way to observe or mutate the value without synchronization.
//! Closures are synchronous and cannot hold the lock across an `await`.
//!
//! # Disciplines
//!
//! - [Discipline::Exclusive]: every access (read or write) is mutually exclusive.
//! - [Discipline::Shared]: any number of readers may proceed together, while writers are
//!   exclusive with respect to readers and other writers. Readers are preferred, but once
//!   the oldest waiting writer has been waiting longer than the configured starvation
//!   threshold, new readers queue behind it.
//!
//! Waiting writers are served in arrival order.
//!
//! # Re-entrancy
//!
//! Acquiring a [GuardedState] from inside one of its own closures would deadlock and is
//! treated as a usage error: it panics immediately.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{guarded::GuardedState, Runner, Spawner, tokio};
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let balance = GuardedState::new(0u64);
//!     let mut handles = Vec::new();
//!     for _ in 0..10 {
//!         let balance = balance.clone();
//!         handles.push(context.clone().spawn(move |_| async move {
//!             balance.with_exclusive(|b| *b += 1).await;
//!         }));
//!     }
//!     for handle in handles {
//!         handle.await.unwrap();
//!     }
//!     assert_eq!(balance.with_shared_read(|b| *b).await, 10);
//! });
//! ```

use crate::utils::{lock, Waiters};
use async_lock::Mutex as AsyncMutex;
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError, RwLock},
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tracing::trace;

/// Default time a writer may wait before new readers stop being admitted.
pub const DEFAULT_STARVATION_THRESHOLD: Duration = Duration::from_millis(1);

/// Locking discipline of a [GuardedState].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Discipline {
    /// All accesses are mutually exclusive.
    #[default]
    Exclusive,
    /// Concurrent readers, exclusive writers.
    Shared {
        /// How long the oldest waiting writer may be bypassed by new readers.
        starvation: Duration,
    },
}

thread_local! {
    /// Identities of the guarded states whose closures are running on this thread.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a guarded state as held by the current thread for the lifetime of the marker.
struct Held(usize);

impl Held {
    /// Panic if `id` is already held by this thread.
    fn check(id: usize) {
        let reentrant = HELD.with(|held| held.borrow().contains(&id));
        assert!(!reentrant, "re-entrant acquisition of guarded state");
    }

    fn enter(id: usize) -> Self {
        HELD.with(|held| held.borrow_mut().push(id));
        Self(id)
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(position) = held.iter().rposition(|id| *id == self.0) {
                held.remove(position);
            }
        });
    }
}

#[derive(Default)]
struct PermitState {
    readers: usize,
    writer: bool,

    /// Waiting writers (ticket and arrival time), oldest first.
    queue: VecDeque<(u64, Instant)>,
    next_ticket: u64,

    waiting_readers: Waiters,
    waiting_writers: Waiters,
}

impl PermitState {
    fn admits_reader(&self, starvation: Duration) -> bool {
        if self.writer {
            return false;
        }
        match self.queue.front() {
            Some((_, since)) => since.elapsed() < starvation,
            None => true,
        }
    }

    fn admits_writer(&self, ticket: u64) -> bool {
        !self.writer && self.readers == 0 && self.queue.front().map(|(t, _)| *t) == Some(ticket)
    }

    fn enqueue_writer(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.push_back((ticket, Instant::now()));
        ticket
    }

    fn wake_all(&self) {
        self.waiting_readers.wake_all();
        self.waiting_writers.wake_all();
    }
}

/// Read-preferring reader/writer admission with a bound on writer starvation.
struct Permits {
    starvation: Duration,
    state: Mutex<PermitState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

impl Permits {
    fn new(starvation: Duration) -> Self {
        Self {
            starvation,
            state: Mutex::new(PermitState::default()),
        }
    }

    fn acquire(&self, mode: Mode) -> Acquire<'_> {
        Acquire {
            permits: self,
            mode,
            key: None,
            ticket: None,
        }
    }

    fn try_acquire(&self, mode: Mode) -> Option<Permit<'_>> {
        let mut state = lock(&self.state);
        let admitted = match mode {
            Mode::Read => state.admits_reader(self.starvation),
            Mode::Write => !state.writer && state.readers == 0 && state.queue.is_empty(),
        };
        if !admitted {
            return None;
        }
        match mode {
            Mode::Read => state.readers += 1,
            Mode::Write => state.writer = true,
        }
        Some(Permit {
            permits: self,
            mode,
        })
    }
}

/// Future resolving to a [Permit] once the requested access is admitted.
struct Acquire<'a> {
    permits: &'a Permits,
    mode: Mode,
    key: Option<u64>,
    ticket: Option<u64>,
}

impl<'a> Future for Acquire<'a> {
    type Output = Permit<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Permit<'a>> {
        let this = self.get_mut();
        let mut state = lock(&this.permits.state);
        let admitted = match this.mode {
            Mode::Read => {
                let admitted = state.admits_reader(this.permits.starvation);
                if admitted {
                    state.readers += 1;
                } else if !state.writer {
                    trace!("reader queued behind starving writer");
                }
                admitted
            }
            Mode::Write => {
                let ticket = match this.ticket {
                    Some(ticket) => ticket,
                    None => *this.ticket.insert(state.enqueue_writer()),
                };
                let admitted = state.admits_writer(ticket);
                if admitted {
                    state.queue.pop_front();
                    state.writer = true;
                    this.ticket = None;
                }
                admitted
            }
        };

        let waiters = match this.mode {
            Mode::Read => &mut state.waiting_readers,
            Mode::Write => &mut state.waiting_writers,
        };
        if admitted {
            waiters.remove(&mut this.key);
            return Poll::Ready(Permit {
                permits: this.permits,
                mode: this.mode,
            });
        }
        waiters.register(&mut this.key, cx.waker());
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if self.key.is_none() && self.ticket.is_none() {
            return;
        }
        let mut state = lock(&self.permits.state);
        match self.mode {
            Mode::Read => state.waiting_readers.remove(&mut self.key),
            Mode::Write => state.waiting_writers.remove(&mut self.key),
        }
        if let Some(ticket) = self.ticket.take() {
            state.queue.retain(|(t, _)| *t != ticket);

            // The next writer (or any starved-out reader) may now proceed
            state.wake_all();
        }
    }
}

/// Admitted access, released on drop.
struct Permit<'a> {
    permits: &'a Permits,
    mode: Mode,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.permits.state);
        match self.mode {
            Mode::Read => {
                state.readers -= 1;
                if state.readers == 0 {
                    state.waiting_writers.wake_all();
                }
            }
            Mode::Write => {
                state.writer = false;
                state.wake_all();
            }
        }
    }
}

enum Inner<S> {
    Exclusive(AsyncMutex<S>),
    Shared { permits: Permits, value: RwLock<S> },
}

/// A value that can only be accessed while holding its lock.
///
/// Cloning a [GuardedState] yields another reference to the same value.
pub struct GuardedState<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for GuardedState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Default> Default for GuardedState<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> GuardedState<S> {
    /// Guard `initial` with [Discipline::Exclusive].
    pub fn new(initial: S) -> Self {
        Self::with_discipline(initial, Discipline::Exclusive)
    }

    /// Guard `initial` with [Discipline::Shared] and the [DEFAULT_STARVATION_THRESHOLD].
    pub fn shared(initial: S) -> Self {
        Self::with_discipline(
            initial,
            Discipline::Shared {
                starvation: DEFAULT_STARVATION_THRESHOLD,
            },
        )
    }

    /// Guard `initial` with the given discipline.
    pub fn with_discipline(initial: S, discipline: Discipline) -> Self {
        let inner = match discipline {
            Discipline::Exclusive => Inner::Exclusive(AsyncMutex::new(initial)),
            Discipline::Shared { starvation } => Inner::Shared {
                permits: Permits::new(starvation),
                value: RwLock::new(initial),
            },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The discipline this state was created with.
    pub fn discipline(&self) -> Discipline {
        match &*self.inner {
            Inner::Exclusive(_) => Discipline::Exclusive,
            Inner::Shared { permits, .. } => Discipline::Shared {
                starvation: permits.starvation,
            },
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Run `f` with exclusive access to the value.
    ///
    /// # Panics
    ///
    /// Panics if called from within a closure already holding this state.
    pub async fn with_exclusive<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        Held::check(self.id());
        match &*self.inner {
            Inner::Exclusive(mutex) => {
                let mut guard = mutex.lock().await;
                let _held = Held::enter(self.id());
                f(&mut guard)
            }
            Inner::Shared { permits, value } => {
                let _permit = permits.acquire(Mode::Write).await;
                let mut guard = value.write().unwrap_or_else(PoisonError::into_inner);
                let _held = Held::enter(self.id());
                f(&mut guard)
            }
        }
    }

    /// Run `f` with read access to the value.
    ///
    /// Under [Discipline::Exclusive], this is as exclusive as [GuardedState::with_exclusive].
    ///
    /// # Panics
    ///
    /// Panics if called from within a closure already holding this state.
    pub async fn with_shared_read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        Held::check(self.id());
        match &*self.inner {
            Inner::Exclusive(mutex) => {
                let guard = mutex.lock().await;
                let _held = Held::enter(self.id());
                f(&guard)
            }
            Inner::Shared { permits, value } => {
                let _permit = permits.acquire(Mode::Read).await;
                let guard = value.read().unwrap_or_else(PoisonError::into_inner);
                let _held = Held::enter(self.id());
                f(&guard)
            }
        }
    }

    /// Run `f` with exclusive access if the lock is immediately available.
    ///
    /// Under [Discipline::Shared], a writer that is already waiting takes precedence.
    pub fn try_with_exclusive<R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        Held::check(self.id());
        match &*self.inner {
            Inner::Exclusive(mutex) => {
                let mut guard = mutex.try_lock()?;
                let _held = Held::enter(self.id());
                Some(f(&mut guard))
            }
            Inner::Shared { permits, value } => {
                let _permit = permits.try_acquire(Mode::Write)?;
                let mut guard = value.write().unwrap_or_else(PoisonError::into_inner);
                let _held = Held::enter(self.id());
                Some(f(&mut guard))
            }
        }
    }

    /// Run `f` with read access if it can be admitted immediately.
    pub fn try_with_shared_read<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        Held::check(self.id());
        match &*self.inner {
            Inner::Exclusive(mutex) => {
                let guard = mutex.try_lock()?;
                let _held = Held::enter(self.id());
                Some(f(&guard))
            }
            Inner::Shared { permits, value } => {
                let _permit = permits.try_acquire(Mode::Read)?;
                let guard = value.read().unwrap_or_else(PoisonError::into_inner);
                let _held = Held::enter(self.id());
                Some(f(&guard))
            }
        }
    }
}
