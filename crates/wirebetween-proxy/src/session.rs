//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Per-connection session running one backend handler invocation."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::debug;
use wirebetween_logging::{wb_info, wb_warn, LogContext};

use crate::backend::{Backend, BoxedStream, Upstreams};
use crate::shutdown::ShutdownSignal;

/// One accepted client connection, from accept to close.
///
/// The session runs the backend handler exactly once, then closes the socket. It
/// never retries the handler; completion is observed through the task that runs it.
pub struct ConnectionSession {
    conn: BoxedStream,
    remote_address: String,
    session_id: u64,
    upstreams: Upstreams,
}

impl ConnectionSession {
    pub fn new(
        conn: BoxedStream,
        remote_address: String,
        session_id: u64,
        upstreams: Upstreams,
    ) -> Self {
        Self {
            conn,
            remote_address,
            session_id,
            upstreams,
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub async fn run(mut self, backend: Arc<dyn Backend>, signal: ShutdownSignal, cluster: String) {
        let ctx = LogContext::new()
            .with_cluster(&cluster)
            .with_remote_address(&self.remote_address)
            .with_session(self.session_id);
        wb_info!(context = ctx, "Accept");

        if let Err(err) = backend
            .handle(&mut self.conn, &self.upstreams, &signal)
            .await
        {
            wb_warn!(context = ctx, "Backend handler failed: {}", err);
        }
        if let Err(err) = self.conn.shutdown().await {
            debug!(session_id = self.session_id, error = %err, "client socket already closed");
        }

        wb_info!(context = ctx, "Close");
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("remote_address", &self.remote_address)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
