//! Replay classic concurrency lessons on the coordination core.
//!
//! Each subcommand runs one scenario on a multi-threaded [tokio](conduit_runtime::tokio)
//! runner and logs what happened:
//!
//! - `ping-pong`: two tasks exchange messages over rendezvous mailboxes.
//! - `drain`: a producer fills a small mailbox, closes it, and the consumer drains it.
//! - `bank`: many depositors update one balance under exclusive access.
//! - `balance`: readers and a writer share a balance under the read-preferring discipline.
//! - `once`: racing callers run an initializer exactly once.
//! - `select`: wait on several mailboxes, without blocking, and with a deadline.
//! - `pool`: run a batch of jobs (some failing, some panicking) on a bounded pool.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin conduit-lessons -- --workers 4 --tasks 20 pool
//! cargo run --release --bin conduit-lessons -- --timeout-ms 250 --log-level debug select
//! ```

mod lessons;

use clap::{value_parser, Arg, ArgAction, Command};
use conduit_runtime::{
    dispatcher::Outcome,
    telemetry,
    tokio::{self, Runner},
    Runner as _,
};
use std::{str::FromStr, time::Duration};
use tracing::{error, info, warn, Level};

fn main() {
    // Parse arguments
    let matches = Command::new("conduit-lessons")
        .about("replay concurrency lessons on the coordination core")
        .subcommand_required(true)
        .arg(
            Arg::new("workers")
                .long("workers")
                .global(true)
                .default_value("4")
                .value_parser(value_parser!(usize))
                .help("Executor threads and pool concurrency"),
        )
        .arg(
            Arg::new("tasks")
                .long("tasks")
                .global(true)
                .default_value("10")
                .value_parser(value_parser!(u64))
                .help("Number of concurrent callers, depositors, or jobs"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .global(true)
                .default_value("100")
                .value_parser(value_parser!(u64))
                .help("Deadline used by the select lesson"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("ping-pong").about("exchange a ping and a pong"))
        .subcommand(Command::new("drain").about("close a mailbox and drain what is left"))
        .subcommand(Command::new("bank").about("deposit concurrently into one account"))
        .subcommand(Command::new("balance").about("read a balance while it is rewritten"))
        .subcommand(Command::new("once").about("race callers to a one-shot initializer"))
        .subcommand(Command::new("select").about("wait on several mailboxes at once"))
        .subcommand(Command::new("pool").about("run jobs on a bounded worker pool"))
        .get_matches();

    // Create logger
    let level = matches
        .get_one::<String>("log-level")
        .expect("Please provide log level");
    let level = Level::from_str(level).expect("Invalid log level");
    telemetry::init(telemetry::Config {
        level,
        json: matches.get_flag("json"),
    });

    // Load lesson parameters
    let workers = *matches
        .get_one::<usize>("workers")
        .expect("Please provide worker count");
    if workers == 0 {
        panic!("Please provide at least one worker");
    }
    let tasks = *matches
        .get_one::<u64>("tasks")
        .expect("Please provide task count");
    let timeout = Duration::from_millis(
        *matches
            .get_one::<u64>("timeout-ms")
            .expect("Please provide timeout"),
    );
    let (lesson, _) = matches.subcommand().expect("Please provide a lesson");
    info!(lesson, workers, tasks, ?timeout, "starting lesson");

    // Run the lesson
    let cfg = tokio::Config {
        worker_threads: workers,
        ..tokio::Config::default()
    };
    let executor = Runner::new(cfg);
    match lesson {
        "ping-pong" => {
            let (ponged, pinged) = executor.start(lessons::ping_pong);
            info!(?pinged, ?ponged, "exchanged messages");
        }
        "drain" => {
            let (drained, after) =
                executor.start(|context| lessons::close_and_drain(context, tasks as u32));
            info!(?drained, ?after, "drained closed mailbox");
        }
        "bank" => {
            let balance =
                executor.start(|context| lessons::bank(context, 1_000, tasks as usize, 100));
            info!(balance, expected = 1_000 + 100 * tasks, "final balance");
        }
        "balance" => {
            let (observed, last) =
                executor.start(|context| lessons::balance(context, 500, 2_000, tasks as usize));
            info!(?observed, last, "readers finished");
        }
        "once" => {
            let runs = executor.start(|context| lessons::once(context, tasks as usize));
            info!(runs, callers = tasks, "initializer finished");
        }
        "select" => {
            let events = executor.start(|context| lessons::select(context, timeout));
            info!(steps = events.len(), "select finished");
        }
        "pool" => {
            let reports = match executor.start(|context| lessons::pool(context, workers, tasks)) {
                Ok(reports) => reports,
                Err(err) => {
                    error!(?err, "pool failed");
                    return;
                }
            };
            let mut completed = 0;
            for report in reports {
                match report.outcome {
                    Outcome::Completed(output) => {
                        completed += 1;
                        info!(job = %report.id, output, "job completed");
                    }
                    Outcome::Failed(reason) => warn!(job = %report.id, %reason, "job failed"),
                    Outcome::Panicked(message) => {
                        warn!(job = %report.id, %message, "job panicked")
                    }
                }
            }
            info!(completed, total = tasks, "pool drained");
        }
        _ => unreachable!("unknown lesson"),
    }
}
