use super::{Config, Context, Executor, Metrics};
use crate::METRICS_PREFIX;
use ::tokio::runtime::Builder;
use prometheus_client::registry::Registry;
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

/// Implementation of [crate::Runner] for the [tokio] runtime.
pub struct Runner {
    cfg: Config,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Runner {
    /// Initialize a new [tokio] runtime with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

impl From<Config> for Runner {
    fn from(cfg: Config) -> Self {
        Self::new(cfg)
    }
}

impl crate::Runner for Runner {
    type Context = Context;

    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future,
    {
        // Create a new registry
        let mut registry = Registry::default();
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));

        // Initialize runtime
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.cfg.worker_threads)
            .enable_all()
            .build()
            .expect("failed to create Tokio runtime");

        // Contexts only hold a handle to the runtime, so the runtime itself is
        // dropped (and all remaining tasks with it) when this function returns.
        let executor = Arc::new(Executor {
            cfg: self.cfg,
            registry: Mutex::new(registry),
            metrics,
            runtime: runtime.handle().clone(),
        });
        let context = Context {
            label: String::new(),
            executor,
        };
        runtime.block_on(f(context))
    }
}
