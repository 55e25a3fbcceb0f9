//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Boundary traits for the wire-protocol backend collaborator."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use wirebetween_common::UpstreamOptions;

use crate::error::BackendError;
use crate::shutdown::ShutdownSignal;

/// Byte stream accepted from a client or checked out from an upstream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Which configured upstream a handle was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamRole {
    Primary,
    Failover,
}

impl UpstreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamRole::Primary => "primary",
            UpstreamRole::Failover => "failover",
        }
    }
}

impl fmt::Display for UpstreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An established upstream connection or pool, shared by every concurrent session.
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Debug {
    fn address(&self) -> &str;

    /// Obtain a stream to the upstream for one client session.
    async fn checkout(&self) -> Result<BoxedStream, BackendError>;

    /// Release the handle. Called once by the supervisor after every session stopped.
    async fn close(&self);
}

pub type UpstreamHandle = Arc<dyn Upstream>;

/// The primary upstream and the optional failover, as handed to each session.
#[derive(Debug, Clone)]
pub struct Upstreams {
    pub primary: UpstreamHandle,
    pub failover: Option<UpstreamHandle>,
}

impl Upstreams {
    pub fn new(primary: UpstreamHandle, failover: Option<UpstreamHandle>) -> Self {
        Self { primary, failover }
    }

    /// Close both handles, failover first.
    pub async fn close(&self) {
        if let Some(failover) = &self.failover {
            failover.close().await;
        }
        self.primary.close().await;
    }
}

/// Wire-protocol collaborator: builds upstream handles and forwards one client
/// connection at a time.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Establish an upstream handle. When `probe` is set the backend must verify
    /// connectivity before returning.
    async fn connect(
        &self,
        options: &UpstreamOptions,
        probe: bool,
    ) -> Result<UpstreamHandle, BackendError>;

    /// Serve one accepted connection until the client finishes, an error occurs, or
    /// `forced` fires. The caller closes `conn` afterwards.
    async fn handle(
        &self,
        conn: &mut BoxedStream,
        upstreams: &Upstreams,
        forced: &ShutdownSignal,
    ) -> Result<(), BackendError>;
}
