//! Utilities for reporting diagnostics.

use tracing::{Level, Subscriber};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Configuration for [init].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum level of events to emit.
    pub level: Level,

    /// Emit events as JSON (with file and line) instead of human-readable text.
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
        }
    }
}

/// Build (but do not install) the subscriber described by `cfg`.
pub fn subscriber(cfg: &Config) -> Box<dyn Subscriber + Send + Sync> {
    let filter = EnvFilter::new(cfg.level.to_string());
    if cfg.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_line_number(true)
            .with_thread_ids(true)
            .with_file(true);
        Box::new(Registry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        Box::new(Registry::default().with(filter).with(fmt_layer))
    }
}

/// Install the subscriber described by `cfg` as the global default.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init(cfg: Config) {
    tracing::subscriber::set_global_default(subscriber(&cfg)).expect("Failed to set subscriber");
}
