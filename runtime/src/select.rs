//! Wait on several mailbox operations (and deadlines) at once.
//!
//! A [Select] is built from a set of cases, each pairing an operation with a handler:
//!
//! - [Select::recv]: receive from a [Receiver] (the handler sees `None` once it is closed and drained).
//! - [Select::send]: send a value on a [Sender].
//! - [Select::future]: complete when an arbitrary future completes.
//! - [Select::timeout]: fire once a delay elapses.
//!
//! Awaiting the [Select] blocks until at least one case is ready, commits exactly that
//! case, and returns the output of its handler. When several cases are ready, one is
//! picked uniformly at random, so no case can starve the others. The exception is a
//! receive case that a zero-capacity send (see [Select::send]) has already handed a
//! value to: that case is always committed first.
//!
//! With [Select::default], a [Select] never blocks: if no case is ready when it is first
//! polled, the default handler runs instead. A [Select] with no cases and no default never
//! completes.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{mailbox::mailbox, select::Select, Clock, Runner, tokio};
//! use std::time::Duration;
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let (_sender, mut receiver) = mailbox::<u32>(1);
//!     let outcome = Select::new()
//!         .recv(&mut receiver, |value| format!("received {value:?}"))
//!         .timeout(context.sleep(Duration::from_millis(10)), || "timed out".to_string())
//!         .await;
//!     assert_eq!(outcome, "timed out");
//! });
//! ```

use crate::mailbox::{Receiver, Sender};
use rand::{seq::SliceRandom, thread_rng};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A single operation of a [Select].
trait Case<R>: Send {
    /// Commit the operation if it is ready, otherwise arrange to be woken.
    fn poll_case(&mut self, cx: &mut Context<'_>) -> Poll<R>;

    /// Whether a counterpart has already committed to this case.
    fn is_matched(&self) -> bool {
        false
    }
}

struct RecvCase<'a, T, F> {
    receiver: &'a mut Receiver<T>,
    handler: Option<F>,
}

impl<T, F, R> Case<R> for RecvCase<'_, T, F>
where
    T: Send,
    F: FnOnce(Option<T>) -> R + Send,
{
    fn poll_case(&mut self, cx: &mut Context<'_>) -> Poll<R> {
        let value = std::task::ready!(self.receiver.poll_take(cx, true));
        let handler = self.handler.take().expect("case polled after completion");
        Poll::Ready(handler(value))
    }

    fn is_matched(&self) -> bool {
        self.receiver.is_matched()
    }
}

impl<T, F> Drop for RecvCase<'_, T, F> {
    fn drop(&mut self) {
        self.receiver.deregister();
    }
}

struct SendCase<'a, T, F> {
    sender: &'a Sender<T>,
    value: Option<T>,
    key: Option<u64>,
    handler: Option<F>,
}

impl<T, F, R> Case<R> for SendCase<'_, T, F>
where
    T: Send,
    F: FnOnce() -> R + Send,
{
    fn poll_case(&mut self, cx: &mut Context<'_>) -> Poll<R> {
        std::task::ready!(self.sender.poll_offer(cx, &mut self.value, &mut self.key));
        let handler = self.handler.take().expect("case polled after completion");
        Poll::Ready(handler())
    }
}

impl<T, F> Drop for SendCase<'_, T, F> {
    fn drop(&mut self) {
        self.sender.deregister(&mut self.key);
    }
}

struct FutureCase<Fut, F> {
    future: Pin<Box<Fut>>,
    handler: Option<F>,
}

impl<Fut, F, R> Case<R> for FutureCase<Fut, F>
where
    Fut: Future + Send,
    F: FnOnce(Fut::Output) -> R + Send,
{
    fn poll_case(&mut self, cx: &mut Context<'_>) -> Poll<R> {
        let output = std::task::ready!(self.future.as_mut().poll(cx));
        let handler = self.handler.take().expect("case polled after completion");
        Poll::Ready(handler(output))
    }
}

/// Future that completes with the handler output of the first ready case.
#[must_use = "futures do nothing unless polled"]
pub struct Select<'a, R> {
    cases: Vec<Box<dyn Case<R> + 'a>>,
    fallback: Option<Box<dyn FnOnce() -> R + Send + 'a>>,
}

impl<'a, R: 'a> Select<'a, R> {
    /// Create a [Select] with no cases.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            fallback: None,
        }
    }

    /// Add a case that receives from `receiver`.
    ///
    /// `handler` is called with `None` if the mailbox is closed and drained.
    pub fn recv<T, F>(mut self, receiver: &'a mut Receiver<T>, handler: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Option<T>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            receiver,
            handler: Some(handler),
        }));
        self
    }

    /// Add a case that sends `value` on `sender`.
    ///
    /// The value is only handed to the mailbox if this case is the one committed.
    ///
    /// For a zero-capacity mailbox, the case is ready only while a [Receiver::recv] or
    /// a receive case of another [Select] is parked on the mailbox. Committing hands the
    /// value to the receiver that has waited longest and completes immediately: unlike
    /// [Sender::send], it does not wait for that receiver to resume. If the receiving
    /// [Select] commits another case first, or its [Receiver::recv] is dropped, the
    /// value stays with that [Receiver] for its next receive (or returns to the
    /// mailbox for other receivers once that [Receiver] is dropped).
    ///
    /// # Panics
    ///
    /// The [Select] panics when polled if the mailbox is closed.
    pub fn send<T, F>(mut self, sender: &'a Sender<T>, value: T, handler: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce() -> R + Send + 'a,
    {
        self.cases.push(Box::new(SendCase {
            sender,
            value: Some(value),
            key: None,
            handler: Some(handler),
        }));
        self
    }

    /// Add a case that completes when `future` completes.
    pub fn future<Fut, F>(mut self, future: Fut, handler: F) -> Self
    where
        Fut: Future + Send + 'a,
        F: FnOnce(Fut::Output) -> R + Send + 'a,
    {
        self.cases.push(Box::new(FutureCase {
            future: Box::pin(future),
            handler: Some(handler),
        }));
        self
    }

    /// Add a case that fires once `delay` completes.
    ///
    /// `delay` is typically [crate::Clock::sleep] or [crate::Clock::sleep_until].
    pub fn timeout<D, F>(self, delay: D, handler: F) -> Self
    where
        D: Future<Output = ()> + Send + 'a,
        F: FnOnce() -> R + Send + 'a,
    {
        self.future(delay, move |()| handler())
    }

    /// Run `handler` instead of blocking if no case is ready.
    pub fn default(mut self, handler: impl FnOnce() -> R + Send + 'a) -> Self {
        self.fallback = Some(Box::new(handler));
        self
    }

    /// Number of cases (not counting the default).
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Returns `true` if no case has been added.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl<R> Future for Select<'_, R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();

        // A receive that was already handed a value must take it
        if let Some(index) = this.cases.iter().position(|case| case.is_matched()) {
            if let Poll::Ready(output) = this.cases[index].poll_case(cx) {
                return Poll::Ready(output);
            }
        }

        // Visit cases in a fresh random order so ready cases are chosen fairly
        let mut order: Vec<usize> = (0..this.cases.len()).collect();
        order.shuffle(&mut thread_rng());
        for index in order {
            if let Poll::Ready(output) = this.cases[index].poll_case(cx) {
                return Poll::Ready(output);
            }
        }

        match this.fallback.take() {
            Some(fallback) => Poll::Ready(fallback()),
            None => Poll::Pending,
        }
    }
}
