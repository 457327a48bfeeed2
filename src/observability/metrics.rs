//! # Metrics
//!
//! Prometheus metrics describing the operator's own activity.
//!
//! ## Metrics Exposed
//!
//! - `shared_resource_operator_ensure_passes_total{task,outcome}` - Ensure passes by outcome
//! - `shared_resource_operator_deployment_reconciles_total{outcome}` - Webhook deployment reconciles
//! - `shared_resource_operator_deployment_reconcile_errors_total` - Failed webhook deployment reconciles
//!
//! The counters are registered into the registry the orchestrator owns, next to
//! the shared resource collector.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct OperatorMetrics {
    ensure_passes: IntCounterVec,
    deployment_reconciles: IntCounterVec,
    deployment_reconcile_errors: IntCounter,
}

impl std::fmt::Debug for OperatorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorMetrics")
            .field(
                "deployment_reconcile_errors",
                &self.deployment_reconcile_errors.get(),
            )
            .finish_non_exhaustive()
    }
}

impl OperatorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            ensure_passes: IntCounterVec::new(
                Opts::new(
                    "shared_resource_operator_ensure_passes_total",
                    "Total number of ensure passes by task and outcome",
                ),
                &["task", "outcome"],
            )?,
            deployment_reconciles: IntCounterVec::new(
                Opts::new(
                    "shared_resource_operator_deployment_reconciles_total",
                    "Total number of webhook deployment reconciles by outcome",
                ),
                &["outcome"],
            )?,
            deployment_reconcile_errors: IntCounter::new(
                "shared_resource_operator_deployment_reconcile_errors_total",
                "Total number of failed webhook deployment reconciles",
            )?,
        })
    }

    /// Register every metric into `registry`
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.ensure_passes.clone()))?;
        registry.register(Box::new(self.deployment_reconciles.clone()))?;
        registry.register(Box::new(self.deployment_reconcile_errors.clone()))?;
        Ok(())
    }

    pub fn record_ensure_pass(&self, task: &str, outcome: &str) {
        self.ensure_passes.with_label_values(&[task, outcome]).inc();
    }

    pub fn ensure_passes(&self, task: &str, outcome: &str) -> u64 {
        self.ensure_passes.with_label_values(&[task, outcome]).get()
    }

    pub fn record_deployment_reconcile(&self, outcome: &str) {
        self.deployment_reconciles.with_label_values(&[outcome]).inc();
    }

    pub fn increment_deployment_reconcile_errors(&self) {
        self.deployment_reconcile_errors.inc();
    }

    pub fn deployment_reconcile_errors(&self) -> u64 {
        self.deployment_reconcile_errors.get()
    }
}
