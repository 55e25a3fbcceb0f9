//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Root supervisor wiring upstreams, acceptor, and crash recovery."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::info;
use wirebetween_common::{ProxyConfig, UpstreamOptions};
use wirebetween_logging::{log_lifecycle_event, wb_error, wb_info, LifecycleOutcome, LogContext};
use wirebetween_metrics::ClusterMetrics;
use wirebetween_resilience::{CrashSupervisor, ResilienceMetrics, RestartPolicy};

use crate::acceptor::ConnectionAcceptor;
use crate::backend::{Backend, UpstreamHandle, UpstreamRole, Upstreams};
use crate::error::ProxyError;
use crate::shutdown::ShutdownSignal;
use crate::transport::BoundAddress;

struct Inner {
    config: Arc<ProxyConfig>,
    backend: Arc<dyn Backend>,
    metrics: ClusterMetrics,
    resilience: Option<ResilienceMetrics>,
    policy: RestartPolicy,
    signal: ShutdownSignal,
    address: Arc<watch::Sender<Option<BoundAddress>>>,
}

/// Owns one proxy's configuration and drives its serve sequence under crash supervision.
///
/// Cloning yields another handle to the same proxy, so one task can call
/// [`ProxySupervisor::run`] while others request shutdown.
#[derive(Clone)]
pub struct ProxySupervisor {
    inner: Arc<Inner>,
}

impl ProxySupervisor {
    pub fn new(config: ProxyConfig, backend: Arc<dyn Backend>, metrics: ClusterMetrics) -> Self {
        Self::builder(config, backend, metrics).build()
    }

    pub fn builder(
        config: ProxyConfig,
        backend: Arc<dyn Backend>,
        metrics: ClusterMetrics,
    ) -> ProxySupervisorBuilder {
        ProxySupervisorBuilder {
            config,
            backend,
            metrics,
            resilience: None,
            policy: RestartPolicy::default(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn cluster(&self) -> &str {
        self.inner.metrics.cluster()
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.inner.signal
    }

    /// Run until deliberate shutdown, a fatal startup error, or an exhausted restart budget.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let inner = self.inner.clone();
        let ctx = LogContext::new().with_cluster(inner.metrics.cluster());
        log_lifecycle_event(Some(&ctx), "start", "proxy starting", LifecycleOutcome::Success);

        let mut crash = CrashSupervisor::new(
            inner.metrics.cluster(),
            inner.policy,
            inner.resilience.clone(),
        )
        .with_shutdown(inner.signal.graceful_token());

        let serving = inner.clone();
        let result = crash.run(move |attempt| serving.clone().serve(attempt)).await;

        match &result {
            Ok(()) => log_lifecycle_event(
                Some(&ctx),
                "stop",
                "proxy stopped",
                LifecycleOutcome::Success,
            ),
            Err(err) => log_lifecycle_event(
                Some(&ctx),
                "stop",
                &format!("proxy failed: {}", err),
                LifecycleOutcome::Fault,
            ),
        }
        result
    }

    /// Stop accepting new connections and let in-flight sessions finish.
    pub fn request_shutdown(&self) {
        if self.inner.signal.request_graceful() {
            let ctx = LogContext::new().with_cluster(self.cluster());
            wb_info!(context = ctx, "Graceful shutdown requested");
        }
    }

    /// Stop accepting and abort every in-flight session.
    pub fn abort(&self) {
        self.request_shutdown();
        if self.inner.signal.request_forced() {
            let ctx = LogContext::new().with_cluster(self.cluster());
            log_lifecycle_event(
                Some(&ctx),
                "abort",
                "forced shutdown requested",
                LifecycleOutcome::Degraded,
            );
        }
    }

    /// TCP address the listener is currently bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.address.borrow().as_ref().and_then(BoundAddress::tcp)
    }

    /// Observe the bound address; `None` while no listener is open.
    pub fn watch_address(&self) -> watch::Receiver<Option<BoundAddress>> {
        self.inner.address.subscribe()
    }

    /// Sessions currently open across the proxy.
    pub fn live_sessions(&self) -> i64 {
        self.inner.metrics.connections().value()
    }
}

/// Optional knobs for a [`ProxySupervisor`].
pub struct ProxySupervisorBuilder {
    config: ProxyConfig,
    backend: Arc<dyn Backend>,
    metrics: ClusterMetrics,
    resilience: Option<ResilienceMetrics>,
    policy: RestartPolicy,
}

impl ProxySupervisorBuilder {
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resilience_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.resilience = Some(metrics);
        self
    }

    pub fn build(self) -> ProxySupervisor {
        let (address, _) = watch::channel(None);
        ProxySupervisor {
            inner: Arc::new(Inner {
                config: Arc::new(self.config),
                backend: self.backend,
                metrics: self.metrics,
                resilience: self.resilience,
                policy: self.policy,
                signal: ShutdownSignal::new(),
                address: Arc::new(address),
            }),
        }
    }
}

impl Inner {
    async fn serve(self: Arc<Self>, attempt: u32) -> Result<(), ProxyError> {
        let ctx = LogContext::new().with_cluster(self.metrics.cluster());
        if attempt > 0 {
            wb_info!(context = ctx, "Serve attempt {}", attempt);
        }

        let primary = self
            .connect_upstream(UpstreamRole::Primary, &self.config.upstream)
            .await?;
        let failover = match self.config.failover.clone() {
            Some(options) => {
                let held = Upstreams::new(primary.clone(), None);
                let connecting = self.clone();
                let connected = closing_on_panic(&held, async move {
                    connecting.connect_upstream(UpstreamRole::Failover, &options).await
                })
                .await;
                match connected {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        primary.close().await;
                        return Err(err);
                    }
                }
            }
            None => None,
        };
        let upstreams = Upstreams::new(primary, failover);

        let acceptor = ConnectionAcceptor::new(
            self.config.clone(),
            self.backend.clone(),
            self.metrics.clone(),
            self.signal.clone(),
        )
        .with_address_publisher(self.address.clone());
        let listening = upstreams.clone();
        let result =
            closing_on_panic(&upstreams, async move { acceptor.listen(listening).await }).await;

        upstreams.close().await;
        wb_info!(context = ctx, "Upstream handles closed");
        if let Err(err) = &result {
            wb_error!(context = ctx, "Listener failed: {}", err);
        }
        result
    }

    async fn connect_upstream(
        &self,
        role: UpstreamRole,
        options: &UpstreamOptions,
    ) -> Result<UpstreamHandle, ProxyError> {
        let started = Instant::now();
        let handle = self
            .backend
            .connect(options, self.config.ping)
            .await
            .map_err(|source| ProxyError::UpstreamConnect { role, source })?;
        self.metrics.observe_upstream_connect(role.as_str(), started.elapsed());
        info!(
            cluster = %self.metrics.cluster(),
            role = %role,
            address = %options.address,
            probe = self.config.ping,
            "upstream connected"
        );
        Ok(handle)
    }
}

/// Await `work` on its own task. A panic closes `held` before it resumes on the caller,
/// so handles acquired so far are released exactly once on that path as well.
async fn closing_on_panic<T, Fut>(held: &Upstreams, work: Fut) -> Result<T, ProxyError>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, ProxyError>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            held.close().await;
            std::panic::resume_unwind(err.into_panic())
        }
        Err(err) => Err(ProxyError::Task(err.to_string())),
    }
}

impl std::fmt::Debug for ProxySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySupervisor")
            .field("cluster", &self.cluster())
            .field("address", &self.inner.config.address)
            .field("graceful", &self.inner.signal.is_graceful_requested())
            .field("forced", &self.inner.signal.is_forced_requested())
            .finish_non_exhaustive()
    }
}
