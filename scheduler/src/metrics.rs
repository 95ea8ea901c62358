use crate::Code;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Label for failure metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabel {
    /// Label of the low-level error code
    pub code: String,
}

impl FailureLabel {
    pub fn from(code: Code) -> Self {
        Self {
            code: code.label().to_string(),
        }
    }
}

/// Metrics for a [crate::Scheduler]
#[derive(Default)]
pub struct Metrics {
    /// Number of registered requests
    pub requests: Gauge,
    /// Number of tokens handed to a worker and not yet reported
    pub in_flight: Gauge,
    /// Number of tokens cooling down after a failure
    pub cooling: Gauge,
    /// Number of tokens chosen for dispatch
    pub chosen: Counter,
    /// Number of tokens fetched
    pub succeeded: Counter,
    /// Number of failed attempts by code
    pub failed: Family<FailureLabel, Counter>,
    /// Number of in-flight tokens that timed out
    pub timeouts: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Metrics::default();
        registry.register(
            "requests",
            "Number of registered requests",
            metrics.requests.clone(),
        );
        registry.register(
            "in_flight",
            "Number of tokens handed to a worker and not yet reported",
            metrics.in_flight.clone(),
        );
        registry.register(
            "cooling",
            "Number of tokens cooling down after a failure",
            metrics.cooling.clone(),
        );
        registry.register(
            "chosen",
            "Number of tokens chosen for dispatch",
            metrics.chosen.clone(),
        );
        registry.register(
            "succeeded",
            "Number of tokens fetched",
            metrics.succeeded.clone(),
        );
        registry.register(
            "failed",
            "Number of failed attempts by code",
            metrics.failed.clone(),
        );
        registry.register(
            "timeouts",
            "Number of in-flight tokens that timed out",
            metrics.timeouts.clone(),
        );
        metrics
    }
}
