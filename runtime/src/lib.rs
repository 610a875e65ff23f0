//! Coordinate concurrent tasks with mailboxes, barriers, guarded state, and a worker pool.
//!
//! This crate provides the building blocks for running many units of work concurrently,
//! communicating their results safely, and waiting for completion or timeout:
//!
//! - [mailbox]: bounded, typed channels with an explicit open/closed lifecycle.
//! - [guarded]: shared state whose every access is mediated by a lock.
//! - [barrier]: a counter that releases waiters once all expected tasks report completion.
//! - [once]: run an initialization routine exactly once across concurrent callers.
//! - [select]: wait on several mailboxes (and deadlines) at once.
//! - [dispatcher]: run a stream of tasks with bounded concurrency and collect their outcomes.
//!
//! # Terminology
//!
//! Tasks are executed by a runtime composed of a `Runner` and a `Context`. The `Runner` drives
//! execution of a root task. The `Context` implements the other traits ([Spawner], [Clock],
//! [Metrics]) to provide core functionality to tasks. For production use, the [tokio] module
//! provides a runtime backed by [Tokio](https://tokio.rs).
//!
//! # Usage Errors
//!
//! Misuse of a primitive (sending on a closed mailbox, closing a mailbox twice, driving a
//! barrier negative, re-entrant lock acquisition, resetting an active barrier) is a programmer
//! bug and panics immediately.

use std::{
    future::Future,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod barrier;
pub mod dispatcher;
pub mod guarded;
pub mod mailbox;
pub mod once;
pub mod select;
pub mod telemetry;
pub mod tokio;
mod utils;
pub use utils::*;

use prometheus_client::registry::Metric;
use select::Select;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("exited: {0}")]
    Exited(String),
    #[error("closed")]
    Closed,
    #[error("timeout")]
    Timeout,
}

/// Interface that any task scheduler must implement to start
/// running tasks.
pub trait Runner {
    /// Context defines the environment available to tasks.
    type Context;

    /// Start running a root task.
    ///
    /// A panic in the root task is not caught: it unwinds through this call.
    /// When this function returns, all spawned tasks will be canceled.
    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future;
}

/// Interface that any task scheduler must implement to spawn tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Enqueue a task to be executed.
    ///
    /// The task is handed a copy of the context it was spawned from. Every task
    /// returns a [Handle], so there is no way to start work that cannot be observed.
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

/// Interface to register and encode metrics.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// It is not permitted for any implementation to use `METRICS_PREFIX` as the start of a
    /// label (reserved for metrics for the runtime).
    fn with_label(&self, label: &str) -> Self;

    /// Register a metric with the runtime.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}

/// Interface that any task scheduler must implement to provide
/// time-based operations.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;

    /// Sleep until the given deadline.
    fn sleep_until(&self, deadline: SystemTime) -> impl Future<Output = ()> + Send + 'static;

    /// Await a future with a timeout, returning [Error::Timeout] if it expires.
    ///
    /// The deadline is one more case of a [Select], so it fires exactly as any other
    /// ready case would.
    fn timeout<F, T>(
        &self,
        duration: Duration,
        future: F,
    ) -> impl Future<Output = Result<T, Error>> + Send + '_
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        async move {
            Select::new()
                .future(future, Ok)
                .timeout(self.sleep(duration), || Err(Error::Timeout))
                .await
        }
    }
}
