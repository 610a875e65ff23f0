//! Bounded, typed channels with an explicit open/closed lifecycle.
//!
//! A mailbox is created with [mailbox] and split into a [Sender] and a [Receiver].
//! Both endpoints can be cloned, so any number of tasks can produce into and consume
//! from the same mailbox. Values from a single sender are received in the order they
//! were sent.
//!
//! # Capacity
//!
//! A mailbox with capacity `C > 0` buffers up to `C` values: [Sender::send] waits only
//! while the buffer is full. A mailbox with capacity `0` performs a rendezvous:
//! [Sender::send] returns only once a receiver has taken the value.
//!
//! [Sender::try_send] on a zero-capacity mailbox succeeds only if a [Receiver::recv]
//! (or a [crate::select::Select] receive case) is parked on it, and hands the value to
//! that receiver directly. Receivers polled through [Receiver::poll_recv] or [Stream]
//! are not matched this way, since the mailbox cannot tell when their caller stops
//! waiting.
//!
//! # Closing
//!
//! The sending side owns the lifecycle. [Sender::close] stops all future sends but
//! keeps values that are already buffered: receivers drain them first and then observe
//! `None` forever. Dropping the last [Sender] of an open mailbox closes it as well.
//!
//! Sending on a closed mailbox and closing a mailbox twice are usage errors and panic.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{mailbox::mailbox, Runner, Spawner, tokio};
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let (sender, mut receiver) = mailbox(2);
//!     context.spawn(move |_| async move {
//!         for i in 0..4 {
//!             sender.send(i).await;
//!         }
//!         sender.close();
//!     });
//!
//!     let mut received = Vec::new();
//!     while let Some(value) = receiver.recv().await {
//!         received.push(value);
//!     }
//!     assert_eq!(received, vec![0, 1, 2, 3]);
//! });
//! ```

use crate::utils::{lock, Waiters};
use futures::Stream;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use thiserror::Error;

/// Error returned by [Sender::try_send].
#[derive(Error, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The mailbox is full (or, for a zero-capacity mailbox, no receiver is waiting).
    #[error("mailbox full")]
    Full(T),
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
        }
    }
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) => value,
        }
    }
}

/// Error returned by [Receiver::try_recv].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No value is buffered but the mailbox is still open.
    #[error("mailbox empty")]
    Empty,
    /// The mailbox is closed and every buffered value has been received.
    #[error("mailbox closed")]
    Closed,
}

struct State<T> {
    capacity: usize,
    closed: bool,
    senders: usize,

    /// Buffered values tagged with their sequence number.
    queue: VecDeque<(u64, T)>,
    next: u64,
    /// Sequence of the most recently received value.
    taken: u64,

    /// Senders waiting for room (or for their value to be taken).
    sending: Waiters,
    /// Receivers waiting for a value.
    receiving: Waiters,

    /// Identity assigned to the next [Receiver] handle.
    next_receiver: u64,
    /// Receivers parked by a receive that withdraws itself on drop, in arrival order.
    ///
    /// Only populated for zero-capacity mailboxes.
    parked: VecDeque<u64>,
    /// Values handed to a specific receiver by a non-blocking rendezvous send.
    handed: HashMap<u64, T>,
}

impl<T> State<T> {
    /// Maximum number of values that may sit in the queue.
    ///
    /// A rendezvous mailbox holds at most one value in flight.
    fn bound(&self) -> usize {
        self.capacity.max(1)
    }

    fn push(&mut self, value: T) -> u64 {
        self.next += 1;
        let sequence = self.next;
        self.queue.push_back((sequence, value));
        self.receiving.wake_all();
        sequence
    }

    fn pop(&mut self) -> Option<T> {
        let (sequence, value) = self.queue.pop_front()?;
        self.taken = self.taken.max(sequence);
        self.sending.wake_all();
        Some(value)
    }

    /// Accept `value` without waiting, or give it back.
    ///
    /// A zero-capacity mailbox accepts a value only by handing it to the receiver that
    /// has been parked the longest.
    fn offer(&mut self, value: T) -> Result<(), T> {
        if self.capacity > 0 {
            if self.queue.len() >= self.capacity {
                return Err(value);
            }
            self.push(value);
            return Ok(());
        }
        let Some(receiver) = self.parked.pop_front() else {
            return Err(value);
        };
        self.handed.insert(receiver, value);
        self.receiving.wake_all();
        Ok(())
    }

    /// Forget that `receiver` is waiting.
    fn unpark(&mut self, receiver: u64, key: &mut Option<u64>) {
        self.receiving.remove(key);
        self.parked.retain(|parked| *parked != receiver);
    }

    /// Withdraw a value that was handed off but never taken.
    fn retract(&mut self, sequence: u64) -> Option<T> {
        let position = self.queue.iter().position(|(s, _)| *s == sequence)?;
        let (_, value) = self.queue.remove(position)?;
        self.sending.wake_all();
        Some(value)
    }

    fn close(&mut self) {
        self.closed = true;
        self.sending.wake_all();
        self.receiving.wake_all();
    }
}

/// Create a mailbox that buffers up to `capacity` values.
///
/// A `capacity` of `0` creates a rendezvous mailbox.
pub fn mailbox<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let state = Arc::new(Mutex::new(State {
        capacity,
        closed: false,
        senders: 1,
        queue: VecDeque::with_capacity(capacity.max(1)),
        next: 0,
        taken: 0,
        sending: Waiters::default(),
        receiving: Waiters::default(),
        next_receiver: 1,
        parked: VecDeque::new(),
        handed: HashMap::new(),
    }));
    (
        Sender {
            state: state.clone(),
        },
        Receiver {
            state,
            id: 0,
            key: None,
        },
    )
}

/// The send-capable endpoint of a mailbox.
pub struct Sender<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Sender<T> {
    /// Send a value, waiting while the mailbox is full.
    ///
    /// For a zero-capacity mailbox, the returned future completes only once a
    /// receiver has taken the value. Dropping the future before then withdraws
    /// the value.
    ///
    /// # Panics
    ///
    /// Panics if the mailbox is closed.
    pub fn send(&self, value: T) -> Sending<'_, T> {
        Sending {
            sender: self,
            value: Some(value),
            sequence: None,
            key: None,
        }
    }

    /// Attempt to send a value without waiting.
    ///
    /// For a zero-capacity mailbox, this succeeds only if a [Receiver::recv] is
    /// currently parked, in which case the value is handed to that receiver.
    ///
    /// # Panics
    ///
    /// Panics if the mailbox is closed.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = lock(&self.state);
        assert!(!state.closed, "send on closed mailbox");
        state.offer(value).map_err(TrySendError::Full)
    }

    /// Close the mailbox.
    ///
    /// Buffered values remain available to receivers.
    ///
    /// # Panics
    ///
    /// Panics if the mailbox is already closed.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        assert!(!state.closed, "close of closed mailbox");
        state.close();
    }

    /// Returns `true` if the mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Returns `true` if no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity the mailbox was created with.
    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Offer `value` if it can be accepted without waiting, otherwise park under `key`.
    ///
    /// Used by [crate::select::Select], where a send case must either commit
    /// completely or not at all.
    pub(crate) fn poll_offer(
        &self,
        cx: &mut Context<'_>,
        value: &mut Option<T>,
        key: &mut Option<u64>,
    ) -> Poll<()> {
        let mut state = lock(&self.state);
        assert!(!state.closed, "send on closed mailbox");
        let Some(offered) = value.take() else {
            return Poll::Ready(());
        };
        match state.offer(offered) {
            Ok(()) => {
                state.sending.remove(key);
                Poll::Ready(())
            }
            Err(offered) => {
                *value = Some(offered);
                state.sending.register(key, cx.waker());
                Poll::Pending
            }
        }
    }

    /// Stop waiting under `key`.
    pub(crate) fn deregister(&self, key: &mut Option<u64>) {
        if key.is_some() {
            lock(&self.state).sending.remove(key);
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        lock(&self.state).senders += 1;
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.senders -= 1;
        if state.senders == 0 && !state.closed {
            state.close();
        }
    }
}

/// Future returned by [Sender::send].
#[must_use = "futures do nothing unless polled"]
pub struct Sending<'a, T> {
    sender: &'a Sender<T>,
    value: Option<T>,
    /// Sequence of the value once it has been handed off (zero capacity only).
    sequence: Option<u64>,
    key: Option<u64>,
}

// The value is never pinned in place.
impl<T> Unpin for Sending<'_, T> {}

impl<T> Future for Sending<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut state = lock(&this.sender.state);

        // Waiting for a handed-off value to be taken
        if let Some(sequence) = this.sequence {
            if sequence <= state.taken {
                this.sequence = None;
                state.sending.remove(&mut this.key);
                return Poll::Ready(());
            }
            state.sending.register(&mut this.key, cx.waker());
            return Poll::Pending;
        }

        assert!(!state.closed, "send on closed mailbox");
        if state.queue.len() < state.bound() {
            let Some(value) = this.value.take() else {
                return Poll::Ready(());
            };
            let sequence = state.push(value);
            if state.capacity > 0 {
                state.sending.remove(&mut this.key);
                return Poll::Ready(());
            }
            this.sequence = Some(sequence);
        }
        state.sending.register(&mut this.key, cx.waker());
        Poll::Pending
    }
}

impl<T> Drop for Sending<'_, T> {
    fn drop(&mut self) {
        if self.key.is_none() && self.sequence.is_none() {
            return;
        }
        let mut state = lock(&self.sender.state);
        state.sending.remove(&mut self.key);
        if let Some(sequence) = self.sequence.take() {
            if sequence > state.taken {
                drop(state.retract(sequence));
            }
        }
    }
}

/// The receive-capable endpoint of a mailbox.
///
/// [Receiver] implements [Stream], ending once the mailbox is closed and drained.
pub struct Receiver<T> {
    state: Arc<Mutex<State<T>>>,
    id: u64,
    key: Option<u64>,
}

impl<T> Receiver<T> {
    /// Receive the next value, waiting while the mailbox is open and empty.
    ///
    /// Returns `None` once the mailbox is closed and every buffered value has been
    /// received.
    ///
    /// On a zero-capacity mailbox, a parked [Recv] can be matched by [Sender::try_send].
    /// Dropping it withdraws the receiver (a value already handed to it is kept for
    /// the next receive on this handle).
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { receiver: self }
    }

    /// Attempt to receive a value without waiting.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let mut state = lock(&self.state);
        if let Some(value) = state.handed.remove(&self.id) {
            return Ok(value);
        }
        if let Some(value) = state.pop() {
            return Ok(value);
        }
        if state.closed {
            return Err(TryRecvError::Closed);
        }
        Err(TryRecvError::Empty)
    }

    /// Poll for the next value, parking this receiver if none is available.
    ///
    /// A receiver parked this way is woken by any send but is never matched by a
    /// non-blocking rendezvous send.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.poll_take(cx, false)
    }

    /// Poll for the next value.
    ///
    /// `matchable` receivers withdraw themselves on drop (via [Receiver::deregister]),
    /// so a zero-capacity mailbox may hand them a value directly.
    pub(crate) fn poll_take(&mut self, cx: &mut Context<'_>, matchable: bool) -> Poll<Option<T>> {
        let mut state = lock(&self.state);
        let value = match state.handed.remove(&self.id) {
            Some(value) => Some(value),
            None => state.pop(),
        };
        if value.is_some() || state.closed {
            state.unpark(self.id, &mut self.key);
            return Poll::Ready(value);
        }

        state.receiving.register(&mut self.key, cx.waker());
        if state.capacity == 0 {
            let parked = state.parked.contains(&self.id);
            if matchable && !parked {
                // A newly parked receiver may unblock a pending rendezvous send case
                state.parked.push_back(self.id);
                state.sending.wake_all();
            } else if !matchable && parked {
                state.parked.retain(|parked| *parked != self.id);
            }
        }
        Poll::Pending
    }

    /// Returns `true` if a non-blocking rendezvous send already handed this receiver a value.
    pub(crate) fn is_matched(&self) -> bool {
        lock(&self.state).handed.contains_key(&self.id)
    }

    /// Returns `true` if the mailbox has been closed (values may still be buffered).
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Returns `true` if no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop waiting for a value.
    pub(crate) fn deregister(&mut self) {
        if self.key.is_some() {
            lock(&self.state).unpark(self.id, &mut self.key);
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        let mut state = lock(&self.state);
        let id = state.next_receiver;
        state.next_receiver += 1;
        Self {
            state: self.state.clone(),
            id,
            key: None,
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.unpark(self.id, &mut self.key);

        // Return an unclaimed hand-off to the front of the queue for other receivers
        if let Some(value) = state.handed.remove(&self.id) {
            state.queue.push_front((0, value));
            state.receiving.wake_all();
        }
    }
}

impl<T> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().poll_recv(cx)
    }
}

/// Future returned by [Receiver::recv].
#[must_use = "futures do nothing unless polled"]
pub struct Recv<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().receiver.poll_take(cx, true)
    }
}

impl<T> Drop for Recv<'_, T> {
    fn drop(&mut self) {
        self.receiver.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        barrier::CompletionBarrier,
        tokio::{Config, Runner},
        Clock, Runner as _, Spawner,
    };
    use conduit_macros::test_traced;
    use futures::{executor::block_on, StreamExt};
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    #[test]
    fn test_buffered_fifo() {
        block_on(async {
            let (sender, mut receiver) = mailbox(3);
            sender.send(1).await;
            sender.send(2).await;
            sender.send(3).await;
            assert_eq!(sender.len(), 3);
            assert_eq!(receiver.recv().await, Some(1));
            assert_eq!(receiver.recv().await, Some(2));
            assert_eq!(receiver.recv().await, Some(3));
            assert!(receiver.is_empty());
        });
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        block_on(async {
            let (sender, mut receiver) = mailbox(4);
            for i in 1..=3 {
                sender.send(i).await;
            }
            sender.close();
            assert!(receiver.is_closed());

            // Buffered values survive the close
            assert_eq!(receiver.recv().await, Some(1));
            assert_eq!(receiver.recv().await, Some(2));
            assert_eq!(receiver.recv().await, Some(3));

            // Closed indicator is returned forever
            for _ in 0..3 {
                assert_eq!(receiver.recv().await, None);
                assert_eq!(receiver.try_recv(), Err(TryRecvError::Closed));
            }
        });
    }

    #[test]
    #[should_panic(expected = "send on closed mailbox")]
    fn test_send_after_close() {
        block_on(async {
            let (sender, _receiver) = mailbox(1);
            sender.close();
            sender.send(1).await;
        });
    }

    #[test]
    #[should_panic(expected = "send on closed mailbox")]
    fn test_try_send_after_close() {
        let (sender, _receiver) = mailbox(1);
        sender.close();
        let _ = sender.try_send(1);
    }

    #[test]
    #[should_panic(expected = "close of closed mailbox")]
    fn test_double_close() {
        let (sender, _receiver) = mailbox::<u8>(1);
        let other = sender.clone();
        sender.close();
        other.close();
    }

    #[test]
    fn test_drop_last_sender_closes() {
        block_on(async {
            let (sender, mut receiver) = mailbox(2);
            let other = sender.clone();
            sender.send("a").await;
            drop(sender);
            assert!(!receiver.is_closed());
            other.send("b").await;
            drop(other);
            assert!(receiver.is_closed());
            assert_eq!(receiver.recv().await, Some("a"));
            assert_eq!(receiver.recv().await, Some("b"));
            assert_eq!(receiver.recv().await, None);
        });
    }

    #[test]
    fn test_close_then_drop_is_not_double_close() {
        let (sender, receiver) = mailbox::<u8>(1);
        sender.close();
        drop(sender);
        assert!(receiver.is_closed());
    }

    #[test]
    fn test_try_variants() {
        let (sender, mut receiver) = mailbox(1);
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
        sender.try_send(1).unwrap();
        assert_eq!(sender.try_send(2).unwrap_err().into_inner(), 2);
        assert_eq!(receiver.try_recv(), Ok(1));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_rendezvous_try_send_without_receiver() {
        let (sender, mut receiver) = mailbox(0);
        assert!(matches!(sender.try_send(1), Err(TrySendError::Full(1))));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_abandoned_receives_are_not_waiting() {
        let (sender, mut receiver) = mailbox(0);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        // A stream poll parks the receiver but is never matched
        {
            let mut next = receiver.next();
            assert!(Pin::new(&mut next).poll(&mut cx).is_pending());
            assert!(matches!(sender.try_send(1), Err(TrySendError::Full(1))));
        }
        assert!(matches!(sender.try_send(2), Err(TrySendError::Full(2))));

        // A dropped recv withdraws itself
        {
            let mut recv = receiver.recv();
            assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
        }
        assert!(matches!(sender.try_send(3), Err(TrySendError::Full(3))));
        assert!(sender.is_empty());
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_try_send_hands_off_to_parked_recv() {
        let (sender, mut receiver) = mailbox(0);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut recv = receiver.recv();
        assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());

        // One parked receive absorbs exactly one value
        sender.try_send(7).unwrap();
        assert!(sender.is_empty());
        assert!(matches!(sender.try_send(8), Err(TrySendError::Full(8))));
        assert_eq!(Pin::new(&mut recv).poll(&mut cx), Poll::Ready(Some(7)));
    }

    #[test]
    fn test_hand_offs_follow_parking_order() {
        let (sender, mut first) = mailbox(0);
        let mut second = first.clone();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut first_recv = first.recv();
        let mut second_recv = second.recv();
        assert!(Pin::new(&mut first_recv).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut second_recv).poll(&mut cx).is_pending());

        sender.try_send("a").unwrap();
        sender.try_send("b").unwrap();
        assert_eq!(Pin::new(&mut second_recv).poll(&mut cx), Poll::Ready(Some("b")));
        assert_eq!(Pin::new(&mut first_recv).poll(&mut cx), Poll::Ready(Some("a")));
    }

    #[test]
    fn test_handed_value_survives_dropped_recv() {
        let (sender, mut receiver) = mailbox(0);
        let mut other = receiver.clone();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        // Kept by the same receiver after its recv is dropped
        {
            let mut recv = receiver.recv();
            assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
            sender.try_send(1).unwrap();
        }
        assert_eq!(other.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(receiver.try_recv(), Ok(1));

        // Returned to the mailbox once the receiver itself is dropped
        {
            let mut recv = receiver.recv();
            assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
            sender.try_send(2).unwrap();
        }
        drop(receiver);
        assert_eq!(other.try_recv(), Ok(2));
        assert_eq!(other.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_stream_ends_on_close() {
        block_on(async {
            let (sender, receiver) = mailbox(8);
            for i in 0..5 {
                sender.send(i).await;
            }
            drop(sender);
            let received: Vec<_> = receiver.collect().await;
            assert_eq!(received, vec![0, 1, 2, 3, 4]);
        });
    }

    #[test]
    fn test_dropped_rendezvous_send_is_withdrawn() {
        let (sender, mut receiver) = mailbox(0);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        {
            // Hand the value off but abandon the send before it is taken
            let mut sending = sender.send(5);
            assert!(Pin::new(&mut sending).poll(&mut cx).is_pending());
            assert_eq!(sender.len(), 1);
        }
        assert_eq!(sender.len(), 0);
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[test_traced]
    fn test_rendezvous() {
        Runner::default().start(|context| async move {
            let (sender, mut receiver) = mailbox(0);
            let sent = Arc::new(AtomicBool::new(false));
            let handle = context.clone().spawn({
                let sent = sent.clone();
                move |_| async move {
                    sender.send("ping").await;
                    sent.store(true, Ordering::SeqCst);
                }
            });

            // The sender stays blocked until the value is taken
            context.sleep(Duration::from_millis(50)).await;
            assert!(!sent.load(Ordering::SeqCst));
            assert_eq!(receiver.recv().await, Some("ping"));
            handle.await.unwrap();
            assert!(sent.load(Ordering::SeqCst));
        });
    }

    #[test_traced]
    fn test_blocked_send_resumes_after_receive() {
        Runner::default().start(|context| async move {
            let (sender, mut receiver) = mailbox(2);
            let sent = Arc::new(AtomicBool::new(false));
            let handle = context.clone().spawn({
                let sent = sent.clone();
                move |_| async move {
                    sender.send(1).await;
                    sender.send(2).await;
                    sender.send(3).await;
                    sent.store(true, Ordering::SeqCst);
                    sender.close();
                }
            });

            // Third send blocks on the full buffer
            context.sleep(Duration::from_millis(50)).await;
            assert!(!sent.load(Ordering::SeqCst));
            assert_eq!(receiver.recv().await, Some(1));
            handle.await.unwrap();
            assert!(sent.load(Ordering::SeqCst));
            assert_eq!(receiver.recv().await, Some(2));
            assert_eq!(receiver.recv().await, Some(3));
            assert_eq!(receiver.recv().await, None);
        });
    }

    fn many_senders_many_receivers(capacity: usize) {
        const SENDERS: usize = 4;
        const RECEIVERS: usize = 3;
        const PER_SENDER: usize = 200;

        let cfg = Config {
            worker_threads: 4,
            ..Config::default()
        };
        let received = Runner::new(cfg).start(|context| async move {
            let (sender, receiver) = mailbox::<(usize, usize)>(capacity);

            // Producers close the mailbox once every one of them is done
            let barrier = CompletionBarrier::new();
            let spawning = barrier.register();
            for id in 0..SENDERS {
                let sender = sender.clone();
                let token = barrier.register();
                context.clone().spawn(move |_| async move {
                    for i in 0..PER_SENDER {
                        sender.send((id, i)).await;
                    }
                    drop(token);
                });
            }
            drop(spawning);
            context.clone().spawn({
                let barrier = barrier.clone();
                move |_| async move {
                    barrier.wait().await;
                    sender.close();
                }
            });

            // Consumers drain until closed
            let mut handles = Vec::new();
            for _ in 0..RECEIVERS {
                let mut receiver = receiver.clone();
                handles.push(context.clone().spawn(move |_| async move {
                    let mut received = Vec::new();
                    while let Some(value) = receiver.recv().await {
                        received.push(value);
                    }
                    received
                }));
            }
            drop(receiver);
            let mut all = Vec::new();
            for handle in handles {
                all.push(handle.await.unwrap());
            }
            all
        });

        // No value lost or duplicated, and per-sender order holds within each consumer
        let mut counts: HashMap<(usize, usize), usize> = HashMap::new();
        for consumer in &received {
            let mut last: HashMap<usize, usize> = HashMap::new();
            for &(id, i) in consumer {
                *counts.entry((id, i)).or_default() += 1;
                if let Some(previous) = last.insert(id, i) {
                    assert!(previous < i, "sender {id} reordered");
                }
            }
        }
        assert_eq!(counts.len(), SENDERS * PER_SENDER);
        assert!(counts.values().all(|&count| count == 1));
    }

    #[test_traced]
    fn test_many_senders_many_receivers_buffered() {
        many_senders_many_receivers(8);
    }

    #[test_traced]
    fn test_many_senders_many_receivers_rendezvous() {
        many_senders_many_receivers(0);
    }

    #[test_traced]
    fn test_single_sender_fifo_across_capacities() {
        for capacity in [0, 1, 3, 16] {
            let received = Runner::default().start(|context| async move {
                let (sender, mut receiver) = mailbox(capacity);
                context.spawn(move |_| async move {
                    for i in 0..100 {
                        sender.send(i).await;
                    }
                });
                let mut received = Vec::new();
                while let Some(value) = receiver.recv().await {
                    received.push(value);
                }
                received
            });
            assert_eq!(received, (0..100).collect::<Vec<_>>());
        }
    }
}
