//! Prometheus collectors
//!
//! Collectors are created per process and registered into whichever
//! registry the caller hands over: the default registry in `main`, a fresh
//! one in tests.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Operator metrics
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Admission requests by kind, operation and decision
    pub admission_requests: IntCounterVec,
    pub admission_duration: Histogram,
    /// Reconcile cycles by result (`success`, `error`, `timeout`)
    pub reconcile_total: IntCounterVec,
    pub reconcile_duration: Histogram,
    pub workqueue_depth: IntGauge,
}

impl Metrics {
    /// Create the collectors and register them with `registry`
    pub fn register(registry: &Registry) -> Result<Arc<Self>> {
        let metrics = Self::unregistered()?;
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(metrics.admission_requests.clone()),
            Box::new(metrics.admission_duration.clone()),
            Box::new(metrics.reconcile_total.clone()),
            Box::new(metrics.reconcile_duration.clone()),
            Box::new(metrics.workqueue_depth.clone()),
        ];
        for collector in collectors {
            registry.register(collector).map_err(prom_err)?;
        }
        Ok(Arc::new(metrics))
    }

    /// Collectors that are not exported anywhere
    pub fn detached() -> Result<Arc<Self>> {
        Self::unregistered().map(Arc::new)
    }

    fn unregistered() -> Result<Self> {
        Ok(Self {
            admission_requests: IntCounterVec::new(
                Opts::new(
                    "pool_operator_admission_requests_total",
                    "Admission reviews handled",
                ),
                &["kind", "operation", "allowed"],
            )
            .map_err(prom_err)?,
            admission_duration: Histogram::with_opts(HistogramOpts::new(
                "pool_operator_admission_duration_seconds",
                "Time spent answering one admission review",
            ))
            .map_err(prom_err)?,
            reconcile_total: IntCounterVec::new(
                Opts::new("pool_operator_reconcile_total", "Reconcile cycles"),
                &["result"],
            )
            .map_err(prom_err)?,
            reconcile_duration: Histogram::with_opts(HistogramOpts::new(
                "pool_operator_reconcile_duration_seconds",
                "Time spent in one reconcile cycle",
            ))
            .map_err(prom_err)?,
            workqueue_depth: IntGauge::new(
                "pool_operator_workqueue_depth",
                "Keys waiting in the reconcile queue",
            )
            .map_err(prom_err)?,
        })
    }

    pub fn record_admission(&self, kind: &str, operation: &str, allowed: bool, seconds: f64) {
        self.admission_requests
            .with_label_values(&[kind, operation, if allowed { "true" } else { "false" }])
            .inc();
        self.admission_duration.observe(seconds);
    }

    pub fn record_reconcile(&self, result: &str, seconds: f64) {
        self.reconcile_total.with_label_values(&[result]).inc();
        self.reconcile_duration.observe(seconds);
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}
