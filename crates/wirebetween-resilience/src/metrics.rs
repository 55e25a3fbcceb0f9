//! ---
//! wb_section: "07-resilience-fault-tolerance"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Crash isolation and restart supervision."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use anyhow::Result;
use prometheus::{IntCounterVec, Opts};
use wirebetween_metrics::SharedRegistry;

/// Metrics published by the crash supervisor.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    crashes_total: IntCounterVec,
    restarts_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let crashes_total = IntCounterVec::new(
            Opts::new(
                "wirebetween_crashes_total",
                "Serve sequences that terminated with an unexpected runtime failure",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(crashes_total.clone()))?;

        let restarts_total = IntCounterVec::new(
            Opts::new(
                "wirebetween_restarts_total",
                "Serve sequences restarted after a crash",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(restarts_total.clone()))?;

        Ok(Self {
            registry,
            crashes_total,
            restarts_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one crash for the cluster.
    pub fn record_crash(&self, cluster: &str) {
        self.crashes_total.with_label_values(&[cluster]).inc();
    }

    /// Count one restart attempt for the cluster.
    pub fn record_restart(&self, cluster: &str) {
        self.restarts_total.with_label_values(&[cluster]).inc();
    }

    /// Crashes recorded so far for the cluster.
    pub fn crashes(&self, cluster: &str) -> u64 {
        self.crashes_total.with_label_values(&[cluster]).get()
    }

    /// Restarts recorded so far for the cluster.
    pub fn restarts(&self, cluster: &str) -> u64 {
        self.restarts_total.with_label_values(&[cluster]).get()
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
