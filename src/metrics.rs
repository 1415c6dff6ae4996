//! Prometheus metrics
//!
//! All collectors live in one explicit [`Registry`] owned by [`Metrics`];
//! the binary serves it on `/metrics`.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Control plane metrics
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    rollbacks: IntCounter,
    relayed_events: IntCounter,
}

impl Metrics {
    /// Create and register all collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("pool_broker".into()), None)
            .map_err(metrics_error)?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconcile invocations by outcome"),
            &["controller", "outcome"],
        )
        .map_err(metrics_error)?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Duration of reconcile invocations"),
            &["controller"],
        )
        .map_err(metrics_error)?;
        let rollbacks = IntCounter::new("create_rollbacks_total", "Creates unwound after a partial failure")
            .map_err(metrics_error)?;
        let relayed_events = IntCounter::new("relayed_events_total", "Runtime events re-emitted on store objects")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciliations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rollbacks.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(relayed_events.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            rollbacks,
            relayed_events,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one reconcile invocation
    pub fn observe_reconcile(&self, controller: &str, outcome: &str, seconds: f64) {
        self.reconciliations
            .with_label_values(&[controller, outcome])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(seconds);
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.inc();
    }

    pub fn inc_relayed_events(&self, count: u64) {
        self.relayed_events.inc_by(count);
    }

    /// Render in the text exposition format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_observations() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_reconcile("scheduler", "done", 0.01);
        metrics.inc_rollbacks();
        metrics.inc_relayed_events(3);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("pool_broker_reconciliations_total{controller=\"scheduler\",outcome=\"done\"} 1"));
        assert!(text.contains("pool_broker_create_rollbacks_total 1"));
        assert!(text.contains("pool_broker_relayed_events_total 3"));
    }
}
