//! Metrics recorded by a [super::Dispatcher].

use crate::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};

/// How a task finished.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    /// The task returned `Ok`.
    Completed,
    /// The task returned `Err`.
    Failed,
    /// The task panicked and was caught at its recovery boundary.
    Panicked,
}

/// Metric label that indicates how a task finished.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Label {
    status: Status,
}

/// Metrics for the [super::Dispatcher].
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of tasks submitted
    pub submitted: Counter,
    /// Number of tasks currently executing
    pub running: Gauge,
    /// Number of tasks finished by status
    pub finished: Family<Label, Counter>,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "submitted",
            "Number of tasks submitted",
            metrics.submitted.clone(),
        );
        context.register(
            "running",
            "Number of tasks currently executing",
            metrics.running.clone(),
        );
        context.register(
            "finished",
            "Number of tasks finished by status",
            metrics.finished.clone(),
        );
        metrics
    }

    /// Record that a task finished with the given status.
    pub fn finish(&self, status: Status) {
        self.running.dec();
        self.finished.get_or_create(&Label { status }).inc();
    }
}
