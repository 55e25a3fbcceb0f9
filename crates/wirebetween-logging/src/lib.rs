//! ---
//! wb_section: "03-observability"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Structured logging context and lifecycle events."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::field::Empty;
use tracing::{Level, Span};
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_test_writer())
        .try_init();
}

/// Structured logging context propagated by spans and the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Cluster label of the owning proxy.
    pub cluster: Option<&'a str>,
    /// Remote address of an accepted client connection.
    pub remote_address: Option<&'a str>,
    /// Monotonic identifier of an accepted session.
    pub session_id: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cluster label. Empty labels are ignored.
    pub fn with_cluster(mut self, cluster: &'a str) -> Self {
        if !cluster.is_empty() {
            self.cluster = Some(cluster);
        }
        self
    }

    /// Attach the remote address of a client. Empty addresses are ignored.
    pub fn with_remote_address(mut self, remote_address: &'a str) -> Self {
        if !remote_address.is_empty() {
            self.remote_address = Some(remote_address);
        }
        self
    }

    /// Attach a session identifier.
    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Build a span carrying every populated field, so that events emitted inside it
    /// (including from spawned tasks that `instrument` it) inherit the context.
    pub fn span(&self, name: &'static str) -> Span {
        let span = tracing::info_span!(
            "wirebetween",
            scope = name,
            cluster = Empty,
            remote_address = Empty,
            session_id = Empty
        );
        if let Some(cluster) = self.cluster {
            span.record("cluster", cluster);
        }
        if let Some(remote_address) = self.remote_address {
            span.record("remote_address", remote_address);
        }
        if let Some(session_id) = self.session_id {
            span.record("session_id", session_id);
        }
        span
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The transition completed normally.
    Success,
    /// The transition was forced or degraded but expected.
    Degraded,
    /// The operation failed.
    Fault,
}

impl LifecycleOutcome {
    /// Stable string form used in the `outcome` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Degraded => "degraded",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (start, stop, crash, restart) for a proxy.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    let cluster = ctx.cluster.unwrap_or("");
    match outcome {
        LifecycleOutcome::Success => {
            tracing::info!(event, outcome = outcome.as_str(), cluster, "{}", message)
        }
        LifecycleOutcome::Degraded => {
            tracing::warn!(event, outcome = outcome.as_str(), cluster, "{}", message)
        }
        LifecycleOutcome::Fault => {
            tracing::error!(event, outcome = outcome.as_str(), cluster, "{}", message)
        }
    }
}
