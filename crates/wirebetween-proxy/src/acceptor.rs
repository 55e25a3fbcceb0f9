//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Listener ownership, accept loop, and connection drain."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use wirebetween_common::ProxyConfig;
use wirebetween_logging::{wb_error, wb_info, wb_warn, LogContext};
use wirebetween_metrics::ClusterMetrics;
use wirebetween_resilience::crash::panic_message;

use crate::backend::{Backend, BoxedStream, Upstreams};
use crate::error::ProxyError;
use crate::session::ConnectionSession;
use crate::shutdown::{race_forced, Race, ShutdownSignal};
use crate::transport::{Accept, BoundAddress, Listener};

/// Pause after a failed accept so a persistent error (e.g. descriptor exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(5);

pub type AddressPublisher = Arc<watch::Sender<Option<BoundAddress>>>;

/// Owns the listening socket for one serve attempt and every session it spawns.
pub struct ConnectionAcceptor {
    config: Arc<ProxyConfig>,
    backend: Arc<dyn Backend>,
    metrics: ClusterMetrics,
    signal: ShutdownSignal,
    address: Option<AddressPublisher>,
    sessions: TaskTracker,
    next_session: AtomicU64,
}

impl ConnectionAcceptor {
    pub fn new(
        config: Arc<ProxyConfig>,
        backend: Arc<dyn Backend>,
        metrics: ClusterMetrics,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            backend,
            metrics,
            signal,
            address: None,
            sessions: TaskTracker::new(),
            next_session: AtomicU64::new(0),
        }
    }

    /// Publish the bound address while listening, and `None` once the socket closes.
    pub fn with_address_publisher(mut self, publisher: AddressPublisher) -> Self {
        self.address = Some(publisher);
        self
    }

    /// Sessions accepted and not yet finished.
    pub fn live_sessions(&self) -> i64 {
        self.metrics.connections().value()
    }

    /// Bind, accept until graceful shutdown, then wait for every session to finish.
    ///
    /// Returns an error only when the listener cannot be bound.
    pub async fn listen(&self, upstreams: Upstreams) -> Result<(), ProxyError> {
        let listener = Listener::bind(&self.config).await?;
        self.listen_on(listener, upstreams).await;
        Ok(())
    }

    /// Accept from an already open `source` until graceful shutdown, then drain.
    ///
    /// `source` is dropped before the drain starts.
    pub async fn listen_on<L: Accept>(&self, source: L, upstreams: Upstreams) {
        let ctx = LogContext::new().with_cluster(self.metrics.cluster());

        let published = match source.local_addr() {
            Ok(bound) => {
                wb_info!(context = ctx, "Listening on {}", bound);
                self.publish(bound)
            }
            Err(err) => {
                wb_warn!(context = ctx, "Listening; local address unavailable: {}", err);
                Published(None)
            }
        };

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.signal.graceful() => break,
                accepted = source.accept() => accepted,
            };
            match accepted {
                Ok((conn, remote_address)) => self.spawn_session(conn, remote_address, &upstreams),
                Err(_) if self.signal.is_graceful_requested() => break,
                Err(err) => {
                    wb_error!(context = ctx, "Failed to accept: {}", err);
                    self.metrics.inc_accept_error();
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }

        drop(source);
        drop(published);

        wb_info!(
            context = ctx,
            "Waiting for open connections ({} live)",
            self.live_sessions()
        );
        self.sessions.close();
        self.sessions.wait().await;
        wb_info!(context = ctx, "All connections drained");
    }

    fn publish(&self, bound: BoundAddress) -> Published<'_> {
        if let Some(publisher) = &self.address {
            publisher.send_replace(Some(bound));
        }
        Published(self.address.as_ref())
    }

    fn spawn_session(&self, conn: BoxedStream, remote_address: String, upstreams: &Upstreams) {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let guard = self.metrics.connections().open();

        let cluster = self.metrics.cluster().to_owned();
        let span = LogContext::new()
            .with_cluster(&cluster)
            .with_remote_address(&remote_address)
            .with_session(session_id)
            .span("session");

        let session =
            ConnectionSession::new(conn, remote_address.clone(), session_id, upstreams.clone());
        let mut running = self.sessions.spawn(
            session
                .run(self.backend.clone(), self.signal.clone(), cluster.clone())
                .instrument(span.clone()),
        );

        let signal = self.signal.clone();
        let metrics = self.metrics.clone();
        self.sessions.spawn(
            async move {
                let ctx = LogContext::new()
                    .with_cluster(&cluster)
                    .with_remote_address(&remote_address)
                    .with_session(session_id);
                match race_forced(&mut running, &signal).await {
                    Race::Completed(Ok(())) => {}
                    Race::Completed(Err(err)) if err.is_panic() => {
                        let payload = err.into_panic();
                        wb_error!(
                            context = ctx,
                            "Session crashed: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                    Race::Completed(Err(err)) => {
                        wb_warn!(context = ctx, "Session task cancelled: {}", err);
                    }
                    Race::Forced => {
                        // Aborting drops the session future and with it the client socket.
                        running.abort();
                        let _ = running.await;
                        metrics.inc_force_closed();
                        wb_warn!(context = ctx, "Force closed connection");
                    }
                }
                drop(guard);
            }
            .instrument(span),
        );
    }
}

/// Withdraws the published address when dropped, unwinding included.
struct Published<'a>(Option<&'a AddressPublisher>);

impl Drop for Published<'_> {
    fn drop(&mut self) {
        if let Some(publisher) = self.0 {
            publisher.send_replace(None);
        }
    }
}

impl std::fmt::Debug for ConnectionAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAcceptor")
            .field("cluster", &self.metrics.cluster())
            .field("address", &self.config.address)
            .field("live_sessions", &self.live_sessions())
            .finish_non_exhaustive()
    }
}
