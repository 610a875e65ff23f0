use crate::{utils::extract_panic_message, Error};
use futures::{
    channel::oneshot,
    stream::{AbortHandle, Abortable},
    FutureExt as _,
};
use prometheus_client::metrics::gauge::Gauge;
use std::{
    any::Any,
    future::Future,
    panic::{resume_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Once},
    task::{Context, Poll},
};
use tracing::error;

/// Drive `f` to completion inside a recovery boundary.
///
/// A panic raised while polling `f` stops at this boundary and is returned as its
/// payload instead of unwinding into the caller.
pub(crate) async fn recover<F: Future>(f: F) -> Result<F::Output, Box<dyn Any + Send>> {
    AssertUnwindSafe(f).catch_unwind().await
}

/// Decrements the running gauge of a task exactly once (on completion or abort).
#[derive(Clone)]
struct Running {
    gauge: Gauge,
    once: Arc<Once>,
}

impl Running {
    fn start(gauge: Gauge) -> Self {
        gauge.inc();
        Self {
            gauge,
            once: Arc::new(Once::new()),
        }
    }

    fn stop(&self) {
        self.once.call_once(|| {
            self.gauge.dec();
        });
    }
}

/// Handle to a spawned task.
///
/// Every task spawned by a [crate::Spawner] returns a [Handle], so the spawner can
/// always observe the outcome of the work it started. Awaiting the handle yields
/// the task output, [Error::Exited] if the task panicked (and panics are caught),
/// or [Error::Closed] if the task was aborted.
pub struct Handle<T>
where
    T: Send + 'static,
{
    aborter: AbortHandle,
    receiver: oneshot::Receiver<Result<T, Error>>,
    running: Running,
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    /// Wrap `f` so that it reports its result (or panic) through the returned [Handle].
    ///
    /// The returned future must be driven by the executor.
    pub(crate) fn init<F>(
        label: String,
        f: F,
        gauge: Gauge,
        catch_panic: bool,
    ) -> (impl Future<Output = ()>, Self)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let running = Running::start(gauge);
        let (sender, receiver) = oneshot::channel();
        let (aborter, registration) = AbortHandle::new_pair();

        let wrapped = {
            let running = running.clone();
            async move {
                let result = recover(f).await;
                running.stop();
                let result = match result {
                    Ok(output) => Ok(output),
                    Err(payload) => {
                        if !catch_panic {
                            resume_unwind(payload);
                        }
                        let message = extract_panic_message(&*payload);
                        error!(task = %label, %message, "task panicked");
                        Err(Error::Exited(message))
                    }
                };

                // The handle may have been dropped (detached task)
                let _ = sender.send(result);
            }
        };

        (
            Abortable::new(wrapped, registration).map(|_| ()),
            Self {
                aborter,
                receiver,
                running,
            },
        )
    }

    /// Abort the task.
    ///
    /// Awaiting the handle of an aborted task yields [Error::Closed].
    pub fn abort(&self) {
        self.aborter.abort();
        self.running.stop();
    }
}

impl<T> Future for Handle<T>
where
    T: Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Closed).and_then(|r| r))
    }
}
