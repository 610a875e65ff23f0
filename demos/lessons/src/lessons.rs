//! Lesson scenarios, each driven entirely by the coordination core.

use conduit_runtime::{
    barrier::CompletionBarrier,
    dispatcher::{Config as DispatcherConfig, Dispatcher, Report},
    guarded::GuardedState,
    mailbox::{mailbox, Receiver, Sender},
    once::OneShot,
    select::Select,
    Clock, Error, Handle, Metrics, Spawner,
};
use futures::StreamExt;
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};

/// Send "ping" and wait for the reply.
///
/// Only the outbound [Sender] and inbound [Receiver] are handed over, so this
/// function can neither receive pings nor send pongs.
async fn ping(pings: Sender<String>, mut pongs: Receiver<String>) -> Option<String> {
    pings.send("ping".to_string()).await;
    debug!("sent ping");
    pongs.recv().await
}

/// Wait for a ping and answer it.
async fn pong(mut pings: Receiver<String>, pongs: Sender<String>) -> Option<String> {
    let received = pings.recv().await;
    pongs.send("pong".to_string()).await;
    debug!("sent pong");
    received
}

/// Exchange a ping and a pong over two rendezvous mailboxes.
///
/// Returns what the ping side and the pong side received.
pub async fn ping_pong<E: Spawner>(context: E) -> (Option<String>, Option<String>) {
    let (ping_sender, ping_receiver) = mailbox(0);
    let (pong_sender, pong_receiver) = mailbox(0);
    let pinger = context
        .clone()
        .spawn(move |_| ping(ping_sender, pong_receiver));
    let ponger = context.spawn(move |_| pong(ping_receiver, pong_sender));
    let pinged = ponger.await.expect("pong task failed");
    let ponged = pinger.await.expect("ping task failed");
    (ponged, pinged)
}

/// Send `count` values into a small mailbox, close it, and drain it.
///
/// Returns the drained values and what a receive after the drain observes.
pub async fn close_and_drain<E: Spawner + Clock>(
    context: E,
    count: u32,
) -> (Vec<u32>, Option<u32>) {
    let (sender, mut receiver) = mailbox(3);
    let producer = context.spawn(move |context| async move {
        for value in 1..=count {
            sender.send(value).await;
            context.sleep(Duration::from_millis(5)).await;
        }
        debug!(count, "closing mailbox");
        sender.close();
    });

    let mut drained = Vec::new();
    while let Some(value) = receiver.next().await {
        drained.push(value);
    }
    let after = receiver.recv().await;
    producer.await.expect("producer failed");
    (drained, after)
}

/// Concurrently deposit `amount` into an account `depositors` times.
///
/// Returns the final balance.
pub async fn bank<E: Spawner>(context: E, initial: u64, depositors: usize, amount: u64) -> u64 {
    let account = GuardedState::new(initial);
    let barrier = CompletionBarrier::new();
    let spawning = barrier.register();
    for depositor in 0..depositors {
        let account = account.clone();
        let token = barrier.register();
        context.clone().spawn(move |_| async move {
            let _token = token;
            let (before, after) = account
                .with_exclusive(|balance| {
                    let before = *balance;
                    *balance += amount;
                    (before, *balance)
                })
                .await;
            debug!(depositor, before, after, "deposited");
        });
    }
    drop(spawning);
    barrier.wait().await;
    account.with_shared_read(|balance| *balance).await
}

/// Readers and a writer share an account under the read-preferring discipline.
///
/// Returns every balance the readers observed and the final balance.
pub async fn balance<E: Spawner>(
    context: E,
    initial: i64,
    target: i64,
    readers: usize,
) -> (Vec<i64>, i64) {
    let account = GuardedState::shared(initial);
    let observed = GuardedState::new(Vec::with_capacity(readers));
    let barrier = CompletionBarrier::new();
    let spawning = barrier.register();

    let spawn_reader = |reader: usize| {
        let account = account.clone();
        let observed = observed.clone();
        let token = barrier.register();
        context.clone().spawn(move |_| async move {
            let _token = token;
            let seen = account.with_shared_read(|balance| *balance).await;
            debug!(reader, seen, "read balance");
            observed.with_exclusive(|observed| observed.push(seen)).await;
        });
    };

    // Readers before and after a single writer
    let before = readers / 2;
    for reader in 0..before {
        spawn_reader(reader);
    }
    {
        let account = account.clone();
        let token = barrier.register();
        context.clone().spawn(move |_| async move {
            let _token = token;
            account.with_exclusive(|balance| *balance = target).await;
            debug!(target, "wrote balance");
        });
    }
    for reader in before..readers {
        spawn_reader(reader);
    }
    drop(spawning);

    barrier.wait().await;
    let observed = observed.with_shared_read(|observed| observed.clone()).await;
    let last = account.with_shared_read(|balance| *balance).await;
    (observed, last)
}

/// Race `callers` tasks to run an initializer, then call it once more.
///
/// Returns how many times the initializer ran.
pub async fn once<E: Spawner>(context: E, callers: usize) -> usize {
    let initializer = OneShot::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(callers);
    for caller in 0..callers {
        let initializer = initializer.clone();
        let runs = runs.clone();
        handles.push(context.clone().spawn(move |_| async move {
            let ran = initializer
                .do_once(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    info!("initializing configuration");
                })
                .await;
            debug!(caller, ran, "initializer returned");
        }));
    }
    for handle in handles {
        handle.await.expect("caller failed");
    }

    // A late call never re-runs the action
    initializer
        .do_once(|| {
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    runs.load(Ordering::SeqCst)
}

/// Send `value` on `sender` after `delay`.
fn deliver_later<E: Spawner + Clock>(
    context: &E,
    sender: Sender<String>,
    delay: Duration,
    value: &str,
) -> Handle<()> {
    let value = value.to_string();
    context.clone().spawn(move |context| async move {
        context.sleep(delay).await;
        sender.send(value).await;
    })
}

/// Wait on several mailboxes at once, without blocking, and with a deadline.
///
/// Returns a line describing each step.
pub async fn select<E: Spawner + Clock>(context: E, timeout: Duration) -> Vec<String> {
    let mut events = Vec::new();

    // Whichever mailbox delivers first is served first. The senders are kept
    // here so neither mailbox closes once its message is delivered.
    let (first, mut first_receiver) = mailbox(0);
    let (second, mut second_receiver) = mailbox(0);
    let deliveries = [
        deliver_later(&context, first.clone(), timeout * 3 / 2, "message from first"),
        deliver_later(&context, second.clone(), timeout, "message from second"),
    ];
    for _ in 0..2 {
        let event = Select::new()
            .recv(&mut first_receiver, |message| format!("received {message:?}"))
            .recv(&mut second_receiver, |message| format!("received {message:?}"))
            .await;
        events.push(event);
    }
    for delivery in deliveries {
        delivery.await.expect("delivery failed");
    }
    drop((first, second));

    // Nothing is ready, so the default case fires
    let (idle, mut idle_receiver) = mailbox::<String>(0);
    events.push(
        Select::new()
            .recv(&mut idle_receiver, |message| format!("received {message:?}"))
            .default(|| "no message ready".to_string())
            .await,
    );
    events.push(
        Select::new()
            .send(&idle, "hello".to_string(), || "sent without blocking".to_string())
            .default(|| "no receiver ready".to_string())
            .await,
    );

    // A slow operation loses to the deadline, a fast one beats it
    for (delay, label) in [(timeout * 2, "slow"), (timeout / 2, "fast")] {
        let (result, mut result_receiver) = mailbox(1);
        let delivery = deliver_later(&context, result, delay, label);
        let event = Select::new()
            .recv(&mut result_receiver, |message| {
                format!("{} finished", message.unwrap_or_default())
            })
            .timeout(context.sleep(timeout), move || format!("{label} timed out"))
            .await;
        events.push(event);

        // Stop an operation that lost to the deadline
        delivery.abort();
        if let Err(err) = delivery.await {
            debug!(label, ?err, "delivery stopped");
        }
    }

    for event in &events {
        info!(event, "select");
    }
    events
}

/// Run `tasks` jobs on a pool of `workers`, where some jobs fail and some panic.
pub async fn pool<E: Spawner + Clock + Metrics>(
    context: E,
    workers: usize,
    tasks: u64,
) -> Result<Vec<Report<u64, String>>, Error> {
    let cfg = DispatcherConfig {
        concurrency: NonZeroUsize::new(workers),
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(context.with_label("pool"), cfg);
    let jobs = (0..tasks).map({
        let context = context.clone();
        move |job| {
            let context = context.clone();
            async move {
                context.sleep(Duration::from_millis(job % 5)).await;
                if job % 11 == 10 {
                    panic!("job {job} crashed");
                }
                if job % 7 == 6 {
                    return Err(format!("job {job} rejected"));
                }
                Ok(job * job)
            }
        }
    });
    dispatcher.run(jobs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_macros::test_traced;
    use conduit_runtime::{dispatcher::Outcome, tokio, Runner};

    #[test_traced]
    fn test_ping_pong() {
        let (ponged, pinged) = tokio::Runner::default().start(ping_pong);
        assert_eq!(ponged.as_deref(), Some("pong"));
        assert_eq!(pinged.as_deref(), Some("ping"));
    }

    #[test_traced]
    fn test_close_and_drain() {
        let (drained, after) =
            tokio::Runner::default().start(|context| close_and_drain(context, 4));
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert_eq!(after, None);
    }

    #[test_traced]
    fn test_bank() {
        let balance = tokio::Runner::default().start(|context| bank(context, 1_000, 50, 100));
        assert_eq!(balance, 6_000);
    }

    #[test_traced]
    fn test_balance() {
        let (observed, last) =
            tokio::Runner::default().start(|context| balance(context, 500, 2_000, 5));
        assert_eq!(observed.len(), 5);
        assert!(observed.iter().all(|seen| *seen == 500 || *seen == 2_000));
        assert_eq!(last, 2_000);
    }

    #[test_traced]
    fn test_once() {
        let runs = tokio::Runner::default().start(|context| once(context, 10));
        assert_eq!(runs, 1);
    }

    #[test_traced]
    fn test_select() {
        let events = tokio::Runner::default()
            .start(|context| select(context, Duration::from_millis(200)));
        assert_eq!(
            events,
            vec![
                "received Some(\"message from second\")".to_string(),
                "received Some(\"message from first\")".to_string(),
                "no message ready".to_string(),
                "no receiver ready".to_string(),
                "slow timed out".to_string(),
                "fast finished".to_string(),
            ]
        );
    }

    #[test_traced]
    fn test_pool() {
        let reports = tokio::Runner::default()
            .start(|context| pool(context, 3, 30))
            .unwrap();
        assert_eq!(reports.len(), 30);
        for report in reports {
            let job = report.id.get();
            match report.outcome {
                Outcome::Completed(output) => assert_eq!(output, job * job),
                Outcome::Failed(reason) => assert_eq!(reason, format!("job {job} rejected")),
                Outcome::Panicked(message) => {
                    assert_eq!(message, format!("job {job} crashed"))
                }
            }
        }
    }
}
