//! A production-focused runtime based on [Tokio](https://tokio.rs).
//!
//! Tasks run on a multi-threaded executor, so many tasks may make progress in
//! parallel. No ordering between tasks is assumed beyond what mailboxes,
//! barriers, and locks establish.
//!
//! # Panics
//!
//! By default, the runtime catches any panic raised by a spawned task, logs it,
//! and reports it through the task's [Handle]. A panic in the root task is never
//! caught.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{Spawner, Runner, Metrics, tokio};
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     println!("Parent started");
//!     let result = context.with_label("child").spawn(|_| async move {
//!         println!("Child started");
//!         "hello"
//!     });
//!     println!("Child result: {:?}", result.await);
//!     println!("Parent exited");
//! });
//! ```

use crate::{Handle, METRICS_PREFIX};
use ::tokio::runtime::Handle as TokioHandle;
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

mod runner;
pub use runner::Runner;

/// Configuration for the [Runner].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker threads used to execute tasks.
    pub worker_threads: usize,

    /// Whether or not to catch panics raised by spawned tasks.
    ///
    /// When disabled, a panicking task is torn down by the executor and its
    /// [Handle] resolves to [crate::Error::Closed].
    pub catch_panics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            catch_panics: true,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    name: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        metrics
    }
}

/// State shared by every [Context] of a single [Runner].
struct Executor {
    cfg: Config,
    registry: Mutex<Registry>,
    metrics: Metrics,
    runtime: TokioHandle,
}

/// Implementation of [crate::Spawner], [crate::Clock], and [crate::Metrics]
/// for the [tokio] runtime.
#[derive(Clone)]
pub struct Context {
    label: String,
    executor: Arc<Executor>,
}

impl crate::Spawner for Context {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // Get metrics
        let work = Work {
            name: self.label.clone(),
        };
        let metrics = &self.executor.metrics;
        metrics.tasks_spawned.get_or_create(&work).inc();
        let gauge = metrics.tasks_running.get_or_create(&work).clone();

        // Set up the task
        let label = self.label.clone();
        let catch_panics = self.executor.cfg.catch_panics;
        let runtime = self.executor.runtime.clone();
        let future = f(self);
        let (task, handle) = Handle::init(label, future, gauge, catch_panics);

        // Spawn the task
        runtime.spawn(task);
        handle
    }
}

impl crate::Metrics for Context {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn with_label(&self, label: &str) -> Self {
        let label = if self.label.is_empty() {
            label.to_string()
        } else {
            format!("{}_{}", self.label, label)
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        Self {
            label,
            executor: self.executor.clone(),
        }
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed = if self.label.is_empty() {
            name
        } else {
            format!("{}_{}", self.label, name)
        };
        self.executor
            .registry
            .lock()
            .unwrap()
            .register(prefixed, help, metric);
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

impl crate::Clock for Context {
    fn current(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        ::tokio::time::sleep(duration)
    }

    fn sleep_until(&self, deadline: SystemTime) -> impl Future<Output = ()> + Send + 'static {
        let duration = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        ::tokio::time::sleep(duration)
    }
}
