//! ---
//! wb_section: "07-resilience-fault-tolerance"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Crash isolation and restart supervision."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Crash isolation for long-running serve loops.
//!
//! A serve sequence runs on its own task. A clean return or an error ends supervision;
//! a panic is logged, counted, and followed by a backoff sleep and a fresh attempt.

pub mod crash;
pub mod metrics;

pub use crash::{CrashError, CrashReport, CrashSupervisor, RestartPolicy};
pub use metrics::ResilienceMetrics;
