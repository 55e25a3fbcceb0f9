//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Byte-level passthrough backend used by the daemon."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use wirebetween_common::UpstreamOptions;

use crate::backend::{Backend, BoxedStream, Upstream, UpstreamHandle, Upstreams};
use crate::error::BackendError;
use crate::shutdown::ShutdownSignal;

/// TCP upstream that dials a fresh connection per checkout.
#[derive(Debug)]
pub struct TcpUpstream {
    options: UpstreamOptions,
    closed: AtomicBool,
}

impl TcpUpstream {
    pub fn new(options: UpstreamOptions) -> Self {
        Self {
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn dial(&self) -> Result<TcpStream, BackendError> {
        let address = self.options.address.as_str();
        match timeout(self.options.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(err)) => Err(BackendError::Io(err)),
            Err(_) => Err(BackendError::Timeout {
                address: address.to_owned(),
            }),
        }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    fn address(&self) -> &str {
        &self.options.address
    }

    async fn checkout(&self) -> Result<BoxedStream, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Unavailable(format!(
                "{} has been closed",
                self.options.address
            )));
        }
        let stream = self.dial().await?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(address = %self.options.address, "upstream closed");
        }
    }
}

/// Forwards bytes between the client and the upstream without interpreting them.
///
/// Checkout falls back to the failover upstream when the primary cannot be reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughBackend;

impl PassthroughBackend {
    pub fn new() -> Self {
        Self
    }

    async fn checkout(&self, upstreams: &Upstreams) -> Result<BoxedStream, BackendError> {
        match upstreams.primary.checkout().await {
            Ok(stream) => Ok(stream),
            Err(primary_err) => match &upstreams.failover {
                Some(failover) => {
                    warn!(
                        primary = %upstreams.primary.address(),
                        failover = %failover.address(),
                        error = %primary_err,
                        "primary checkout failed; using failover"
                    );
                    failover.checkout().await
                }
                None => Err(primary_err),
            },
        }
    }
}

#[async_trait]
impl Backend for PassthroughBackend {
    async fn connect(
        &self,
        options: &UpstreamOptions,
        probe: bool,
    ) -> Result<UpstreamHandle, BackendError> {
        let upstream = TcpUpstream::new(options.clone());
        if probe {
            upstream.dial().await.map_err(|err| match err {
                BackendError::Io(source) => BackendError::Probe {
                    address: options.address.clone(),
                    source,
                },
                other => other,
            })?;
        }
        Ok(Arc::new(upstream))
    }

    async fn handle(
        &self,
        conn: &mut BoxedStream,
        upstreams: &Upstreams,
        forced: &ShutdownSignal,
    ) -> Result<(), BackendError> {
        let mut upstream = self.checkout(upstreams).await?;
        tokio::select! {
            copied = copy_bidirectional(conn, &mut upstream) => {
                let (to_upstream, to_client) = copied?;
                debug!(to_upstream, to_client, "passthrough finished");
            }
            _ = forced.forced() => {
                debug!("passthrough interrupted by forced shutdown");
            }
        }
        let _ = upstream.shutdown().await;
        Ok(())
    }
}
