//! Run many tasks concurrently and collect a report for each.
//!
//! A [Dispatcher] consumes a (lazy) sequence of tasks, where each task is a future
//! resolving to `Result<T, E>`, and executes every task exactly once. With a
//! concurrency limit `L`, a fixed set of `L` workers pulls tasks from an internal
//! mailbox, so at most `L` tasks run at any instant. Without a limit, every task is
//! spawned as soon as it is submitted.
//!
//! Each task runs inside its own recovery boundary: a panic is caught and reported as
//! [Outcome::Panicked] through the same mailbox that carries successful results, so a
//! failing task never takes down its siblings or the dispatcher. Reports arrive in
//! completion order (not submission order) and are tagged with the [TaskId] assigned
//! at submission.
//!
//! The task sequence itself is not a task: if pulling the next task from it panics,
//! no further tasks are submitted, the tasks already submitted still report, and the
//! run ends with [Error::Exited] instead of a (partial) set of reports.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::{dispatcher::{Config, Dispatcher, Outcome}, Runner, tokio};
//! use std::num::NonZeroUsize;
//!
//! let executor = tokio::Runner::default();
//! executor.start(|context| async move {
//!     let cfg = Config {
//!         concurrency: NonZeroUsize::new(2),
//!         ..Config::default()
//!     };
//!     let dispatcher = Dispatcher::new(context, cfg);
//!     let tasks = (0..5u64).map(|i| async move { Ok::<_, String>(i * i) });
//!     let reports = dispatcher.run(tasks).await.unwrap();
//!     assert_eq!(reports.len(), 5);
//!     assert!(reports.iter().all(|r| matches!(r.outcome, Outcome::Completed(_))));
//! });
//! ```

use crate::{
    barrier::CompletionBarrier,
    mailbox::{mailbox, Receiver, Sender},
    utils::{extract_panic_message, recover},
    Error, Handle, Metrics as RuntimeMetrics, Spawner,
};
use std::{fmt, future::Future, num::NonZeroUsize};
use tracing::{debug, error, warn};

mod metrics;
use metrics::{Metrics, Status};

/// Configuration for a [Dispatcher].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of tasks executing at once (`None` for no limit).
    pub concurrency: Option<NonZeroUsize>,

    /// Capacity of the mailboxes used to hand tasks to workers and reports to the caller.
    pub mailbox_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: None,
            mailbox_size: 64,
        }
    }
}

/// Identity of a submitted task (its position in the submitted sequence).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Position of the task in the submitted sequence.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// The task returned `Ok`.
    Completed(T),
    /// The task returned `Err`.
    Failed(E),
    /// The task panicked with the given message.
    Panicked(String),
}

impl<T, E> Outcome<T, E> {
    /// Returns `true` if the task returned `Ok`.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The task output, if it completed.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(output) => Some(output),
            _ => None,
        }
    }
}

/// The result of a single task, tagged with the task's identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report<T, E> {
    pub id: TaskId,
    pub outcome: Outcome<T, E>,
}

/// Executes tasks on a [Spawner], optionally bounding how many run at once.
pub struct Dispatcher<C> {
    context: C,
    cfg: Config,
    metrics: Metrics,
}

impl<C: Spawner + RuntimeMetrics> Dispatcher<C> {
    /// Create a new dispatcher that spawns its tasks from `context`.
    ///
    /// Metrics are registered under the label of `context`.
    pub fn new(context: C, cfg: Config) -> Self {
        let metrics = Metrics::init(&context);
        Self {
            context,
            cfg,
            metrics,
        }
    }

    /// Start executing `tasks` and return a stream of one [Report] per task.
    ///
    /// `tasks` is consumed lazily: the next task is only pulled once it can be handed
    /// to a worker.
    pub fn stream<I, F, T, E>(&self, tasks: I) -> Reports<T, E>
    where
        I: IntoIterator<Item = F>,
        I::IntoIter: Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let tasks = tasks.into_iter();
        let (reports, receiver) = mailbox(self.cfg.mailbox_size);
        let metrics = self.metrics.clone();
        let feeder = self.context.with_label("feeder");
        let feeder = match self.cfg.concurrency {
            Some(limit) => {
                let mailbox_size = self.cfg.mailbox_size;
                feeder.spawn(move |context| {
                    feed_workers(context, limit, mailbox_size, tasks, reports, metrics)
                })
            }
            None => feeder.spawn(move |context| feed_tasks(context, tasks, reports, metrics)),
        };
        Reports {
            receiver,
            feeder: Some(feeder),
        }
    }

    /// Execute `tasks` and wait for every one of them to report.
    ///
    /// Reports are returned in completion order. Returns [Error::Exited] if `tasks`
    /// panicked while being consumed.
    pub async fn run<I, F, T, E>(&self, tasks: I) -> Result<Vec<Report<T, E>>, Error>
    where
        I: IntoIterator<Item = F>,
        I::IntoIter: Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut stream = self.stream(tasks);
        let mut reports = Vec::new();
        while let Some(report) = stream.recv().await? {
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Reports produced by [Dispatcher::stream], in completion order.
pub struct Reports<T, E> {
    receiver: Receiver<Report<T, E>>,
    feeder: Option<Handle<()>>,
}

impl<T, E> Reports<T, E> {
    /// Receive the next report.
    ///
    /// Returns `Ok(None)` once every submitted task has reported. If the task sequence
    /// panicked, the reports of the tasks submitted before the panic are delivered
    /// first and the stream then ends with [Error::Exited].
    pub async fn recv(&mut self) -> Result<Option<Report<T, E>>, Error> {
        if let Some(report) = self.receiver.recv().await {
            return Ok(Some(report));
        }
        let Some(feeder) = self.feeder.take() else {
            return Ok(None);
        };
        feeder.await.map(|()| None)
    }
}

/// Run a single task inside its recovery boundary.
async fn execute<F, T, E>(id: TaskId, task: F, metrics: &Metrics) -> Report<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    debug!(task = %id, "task started");
    metrics.running.inc();
    let outcome = match recover(task).await {
        Ok(Ok(output)) => {
            metrics.finish(Status::Completed);
            Outcome::Completed(output)
        }
        Ok(Err(err)) => {
            warn!(task = %id, "task failed");
            metrics.finish(Status::Failed);
            Outcome::Failed(err)
        }
        Err(payload) => {
            let message = extract_panic_message(&*payload);
            warn!(task = %id, %message, "task panicked");
            metrics.finish(Status::Panicked);
            Outcome::Panicked(message)
        }
    };
    debug!(task = %id, "task finished");
    Report { id, outcome }
}

/// Hand tasks to a fixed set of workers.
async fn feed_workers<C, I, F, T, E>(
    context: C,
    limit: NonZeroUsize,
    mailbox_size: usize,
    tasks: I,
    reports: Sender<Report<T, E>>,
    metrics: Metrics,
) where
    C: Spawner + RuntimeMetrics,
    I: Iterator<Item = F>,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (jobs, queue) = mailbox::<(TaskId, F)>(mailbox_size);
    let barrier = CompletionBarrier::new();

    // Start workers
    let mut workers = Vec::with_capacity(limit.get());
    for worker in 0..limit.get() {
        let token = barrier.register();
        let mut queue = queue.clone();
        let reports = reports.clone();
        let metrics = metrics.clone();
        workers.push(
            context
                .with_label("worker")
                .spawn(move |_| async move {
                    while let Some((id, task)) = queue.recv().await {
                        let report = execute(id, task, &metrics).await;
                        reports.send(report).await;
                    }
                    debug!(worker, "worker exiting");
                    drop(token);
                }),
        );
    }
    drop(queue);

    // Submit tasks as workers free up
    let mut submitted = 0;
    for (index, task) in tasks.enumerate() {
        metrics.submitted.inc();
        jobs.send((TaskId(index as u64), task)).await;
        submitted += 1;
    }
    jobs.close();
    debug!(submitted, workers = limit.get(), "all tasks submitted");

    // Wait for every worker to drain the queue
    barrier.wait().await;
    for worker in workers {
        if let Err(err) = worker.await {
            error!(?err, "worker failed");
        }
    }
    reports.close();
}

/// Spawn every task as soon as it is submitted.
async fn feed_tasks<C, I, F, T, E>(
    context: C,
    tasks: I,
    reports: Sender<Report<T, E>>,
    metrics: Metrics,
) where
    C: Spawner + RuntimeMetrics,
    I: Iterator<Item = F>,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let barrier = CompletionBarrier::new();

    // Hold the barrier open until every task has been registered
    let feeding = barrier.register();
    let mut submitted = 0;
    for (index, task) in tasks.enumerate() {
        metrics.submitted.inc();
        let id = TaskId(index as u64);
        let token = barrier.register();
        let reports = reports.clone();
        let metrics = metrics.clone();
        context.with_label("task").spawn(move |_| async move {
            let report = execute(id, task, &metrics).await;
            reports.send(report).await;
            drop(token);
        });
        submitted += 1;
    }
    drop(feeding);
    debug!(submitted, "all tasks submitted");

    barrier.wait().await;
    reports.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tokio::{self, Runner},
        Clock, Runner as _,
    };
    use conduit_macros::test_traced;
    use std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    /// Tasks that record how many of them run at once.
    fn tracked<E: Clock>(
        context: E,
        count: usize,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> impl Iterator<Item = impl Future<Output = Result<usize, String>> + Send + 'static>
           + Send
           + 'static {
        (0..count).map(move |i| {
            let context = context.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                context.sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }
        })
    }

    /// Tasks where one fails and one panics.
    fn faulty(
        count: usize,
    ) -> impl Iterator<Item = impl Future<Output = Result<usize, String>> + Send + 'static>
           + Send
           + 'static {
        (0..count).map(|i| async move {
            match i {
                3 => Err(format!("task {i} failed")),
                5 => panic!("task {i} exploded"),
                _ => Ok(i * 10),
            }
        })
    }

    fn bounded(limit: usize) -> Config {
        Config {
            concurrency: NonZeroUsize::new(limit),
            mailbox_size: 4,
        }
    }

    #[test_traced]
    fn test_bounded_concurrency() {
        let cfg = tokio::Config {
            worker_threads: 4,
            ..tokio::Config::default()
        };
        Runner::new(cfg).start(|context| async move {
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let dispatcher = Dispatcher::new(context.with_label("pool"), bounded(3));
            let reports = dispatcher
                .run(tracked(context.clone(), 20, running, peak.clone()))
                .await
                .unwrap();

            // Every task reported exactly once
            assert_eq!(reports.len(), 20);
            let ids: BTreeSet<_> = reports.iter().map(|r| r.id.get()).collect();
            assert_eq!(ids, (0..20).collect::<BTreeSet<_>>());
            for report in reports {
                assert_eq!(
                    report.outcome,
                    Outcome::Completed(report.id.get() as usize)
                );
            }

            // Never more than the limit at once
            assert!(peak.load(Ordering::SeqCst) <= 3);
        });
    }

    #[test_traced]
    fn test_unbounded_runs_everything_at_once() {
        Runner::default().start(|context| async move {
            const TASKS: usize = 50;
            let started = CompletionBarrier::new();
            started.add_expected(TASKS as isize);

            // Each task waits until all of them have started, which only
            // terminates if nothing limits concurrency
            let tasks = (0..TASKS).map({
                let started = started.clone();
                move |i| {
                    let started = started.clone();
                    async move {
                        started.signal_done();
                        started.wait().await;
                        Ok::<_, ()>(i)
                    }
                }
            });
            let dispatcher = Dispatcher::new(context.with_label("pool"), Config::default());
            let result = context
                .timeout(Duration::from_secs(5), async move {
                    dispatcher.run(tasks).await
                })
                .await
                .expect("dispatcher stalled")
                .unwrap();
            assert_eq!(result.len(), TASKS);
            assert!(started.is_released());
        });
    }

    fn check_isolation(cfg: Config) {
        Runner::default().start(|context| async move {
            let dispatcher = Dispatcher::new(context.with_label("pool"), cfg);
            let mut reports = dispatcher.run(faulty(8)).await.unwrap();
            reports.sort_by_key(|r| r.id);
            assert_eq!(reports.len(), 8);
            for report in reports {
                let i = report.id.get() as usize;
                match i {
                    3 => assert_eq!(report.outcome, Outcome::Failed("task 3 failed".into())),
                    5 => assert_eq!(
                        report.outcome,
                        Outcome::Panicked("task 5 exploded".into())
                    ),
                    _ => assert_eq!(report.outcome, Outcome::Completed(i * 10)),
                }
            }
        });
    }

    #[test_traced]
    fn test_failures_are_isolated_bounded() {
        check_isolation(bounded(2));
    }

    #[test_traced]
    fn test_failures_are_isolated_unbounded() {
        check_isolation(Config::default());
    }

    #[test_traced]
    fn test_stream_reports() {
        Runner::default().start(|context| async move {
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let dispatcher = Dispatcher::new(context.with_label("pool"), bounded(2));
            let mut reports = dispatcher.stream(tracked(context.clone(), 10, running, peak));
            let mut seen = 0;
            while let Some(report) = reports.recv().await.unwrap() {
                assert!(report.outcome.is_completed());
                seen += 1;
            }
            assert_eq!(seen, 10);
        });
    }

    #[test_traced]
    fn test_no_tasks() {
        for cfg in [bounded(4), Config::default()] {
            Runner::default().start(|context| async move {
                let dispatcher = Dispatcher::new(context, cfg);
                let tasks = std::iter::empty::<std::future::Ready<Result<(), ()>>>();
                assert!(dispatcher.run(tasks).await.unwrap().is_empty());
            });
        }
    }

    #[test_traced]
    fn test_metrics() {
        Runner::default().start(|context| async move {
            let dispatcher = Dispatcher::new(context.with_label("pool"), bounded(2));
            let reports = dispatcher.run(faulty(8)).await.unwrap();
            assert_eq!(reports.len(), 8);

            let buffer = context.encode();
            assert!(buffer.contains("pool_submitted_total 8"));
            assert!(buffer.contains("pool_running 0"));
            assert!(buffer.contains("pool_finished_total{status=\"Completed\"} 6"));
            assert!(buffer.contains("pool_finished_total{status=\"Failed\"} 1"));
            assert!(buffer.contains("pool_finished_total{status=\"Panicked\"} 1"));
        });
    }

    fn check_source_panic(cfg: Config) {
        Runner::default().start(|context| async move {
            let dispatcher = Dispatcher::new(context.with_label("pool"), cfg);

            // The sequence panics while producing its sixth task
            let tasks = (0..10u64).map(|i| {
                if i == 5 {
                    panic!("no task {i}");
                }
                async move { Ok::<_, ()>(i) }
            });
            let result = dispatcher.run(tasks).await;
            assert_eq!(result, Err(Error::Exited("no task 5".into())));

            // Tasks submitted before the panic still report, then the stream fails
            let tasks = (0..10u64).map(|i| {
                if i == 5 {
                    panic!("no task {i}");
                }
                async move { Ok::<_, ()>(i) }
            });
            let mut stream = dispatcher.stream(tasks);
            let mut ids = BTreeSet::new();
            let error = loop {
                match stream.recv().await {
                    Ok(Some(report)) => {
                        assert_eq!(report.outcome, Outcome::Completed(report.id.get()));
                        ids.insert(report.id.get());
                    }
                    Ok(None) => panic!("stream ended without error"),
                    Err(err) => break err,
                }
            };
            assert_eq!(error, Error::Exited("no task 5".into()));
            assert_eq!(ids, (0..5).collect::<BTreeSet<_>>());
        });
    }

    #[test_traced]
    fn test_source_panic_fails_run_bounded() {
        check_source_panic(bounded(2));
    }

    #[test_traced]
    fn test_source_panic_fails_run_unbounded() {
        check_source_panic(Config::default());
    }
}
