//! ---
//! wb_section: "03-observability"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Metrics collection and export utilities."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub async fn spawn_http_server(
    registry: SharedRegistry,
    addr: SocketAddr,
) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let addr = listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "wirebetween_starts_total",
            "Total number of times the wirebetween daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "wirebetween_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new(
                "wirebetween_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Per-cluster connection metric families shared by every proxy in the process.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: SharedRegistry,
    open_connections: IntGaugeVec,
    connections_opened: IntCounterVec,
    connections_closed: IntCounterVec,
    connections_force_closed: IntCounterVec,
    accept_errors: IntCounterVec,
    upstream_connect_seconds: HistogramVec,
}

impl ProxyMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let open_connections = IntGaugeVec::new(
            Opts::new(
                "wirebetween_open_connections",
                "Client connections currently being served",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(open_connections.clone()))?;

        let connections_opened = IntCounterVec::new(
            Opts::new(
                "wirebetween_connections_opened_total",
                "Client connections accepted",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(connections_opened.clone()))?;

        let connections_closed = IntCounterVec::new(
            Opts::new(
                "wirebetween_connections_closed_total",
                "Client connections whose session completed",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(connections_closed.clone()))?;

        let connections_force_closed = IntCounterVec::new(
            Opts::new(
                "wirebetween_connections_force_closed_total",
                "Client connections aborted by a forced shutdown",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(connections_force_closed.clone()))?;

        let accept_errors = IntCounterVec::new(
            Opts::new(
                "wirebetween_accept_errors_total",
                "Accept calls that failed outside of shutdown",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(accept_errors.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "wirebetween_upstream_connect_seconds",
            "Time spent establishing an upstream handle",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 16)?);
        let upstream_connect_seconds = HistogramVec::new(histogram_opts, &["cluster", "role"])?;
        registry.register(Box::new(upstream_connect_seconds.clone()))?;

        Ok(Self {
            registry,
            open_connections,
            connections_opened,
            connections_closed,
            connections_force_closed,
            accept_errors,
            upstream_connect_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Bind every family to one cluster label.
    pub fn for_cluster(&self, cluster: &str) -> ClusterMetrics {
        let labels = [cluster];
        ClusterMetrics {
            cluster: cluster.to_owned(),
            gauge: ConnectionGauge {
                live: Arc::new(AtomicI64::new(0)),
                open: self.open_connections.with_label_values(&labels),
                opened: self.connections_opened.with_label_values(&labels),
                closed: self.connections_closed.with_label_values(&labels),
            },
            force_closed: self.connections_force_closed.with_label_values(&labels),
            accept_errors: self.accept_errors.with_label_values(&labels),
            upstream_connect_seconds: self.upstream_connect_seconds.clone(),
        }
    }
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics").finish_non_exhaustive()
    }
}

/// Metric handles pre-bound to a single cluster label.
#[derive(Clone)]
pub struct ClusterMetrics {
    cluster: String,
    gauge: ConnectionGauge,
    force_closed: IntCounter,
    accept_errors: IntCounter,
    upstream_connect_seconds: HistogramVec,
}

impl ClusterMetrics {
    /// Handles registered against a private registry, for callers that do not export metrics.
    pub fn detached(cluster: &str) -> Result<Self> {
        Ok(ProxyMetrics::new(new_registry())?.for_cluster(cluster))
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn connections(&self) -> &ConnectionGauge {
        &self.gauge
    }

    pub fn inc_force_closed(&self) {
        self.force_closed.inc();
    }

    pub fn force_closed(&self) -> u64 {
        self.force_closed.get()
    }

    pub fn inc_accept_error(&self) {
        self.accept_errors.inc();
    }

    pub fn accept_errors(&self) -> u64 {
        self.accept_errors.get()
    }

    pub fn observe_upstream_connect(&self, role: &str, duration: Duration) {
        self.upstream_connect_seconds
            .with_label_values(&[self.cluster.as_str(), role])
            .observe(duration.as_secs_f64());
    }
}

impl std::fmt::Debug for ClusterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMetrics")
            .field("cluster", &self.cluster)
            .field("open_connections", &self.gauge.value())
            .finish_non_exhaustive()
    }
}

/// Background gauge tracking concurrently open connections.
///
/// [`ConnectionGauge::open`] is the "opened" event; dropping the returned guard is the
/// matching "closed" event. A guard drops exactly once, so every decrement is paired
/// with an earlier increment and the gauge never goes negative.
///
/// Handles returned by separate [`ProxyMetrics::for_cluster`] calls share the exported
/// series when their label matches, but [`ConnectionGauge::value`] only counts guards
/// opened through this handle and its clones.
#[derive(Clone)]
pub struct ConnectionGauge {
    live: Arc<AtomicI64>,
    open: IntGauge,
    opened: IntCounter,
    closed: IntCounter,
}

impl ConnectionGauge {
    #[must_use = "dropping the guard immediately records the connection as closed"]
    pub fn open(&self) -> ConnectionGuard {
        self.opened.inc();
        self.open.inc();
        self.live.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            live: self.live.clone(),
            open: self.open.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Guards currently open through this handle.
    pub fn value(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Value of the exported series, summed over every handle sharing the label.
    pub fn exported_value(&self) -> i64 {
        self.open.get()
    }

    pub fn opened_total(&self) -> u64 {
        self.opened.get()
    }

    pub fn closed_total(&self) -> u64 {
        self.closed.get()
    }
}

/// Guard recording a connection as open until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<AtomicI64>,
    open: IntGauge,
    closed: IntCounter,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.open.dec();
        self.closed.inc();
    }
}

pub use prometheus;
