//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Connection supervision core of the wirebetween proxy."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
//! Connection acceptance and lifecycle supervision.
//!
//! A [`ProxySupervisor`] establishes the upstream handles, then hands them to a
//! [`ConnectionAcceptor`] which owns the listening socket and runs one
//! [`ConnectionSession`] per accepted client. Shutdown is two-phase and driven by a
//! shared [`ShutdownSignal`]: graceful stops accepting and drains, forced aborts every
//! in-flight session.

pub mod acceptor;
pub mod backend;
pub mod error;
pub mod passthrough;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use acceptor::ConnectionAcceptor;
pub use backend::{
    AsyncStream, Backend, BoxedStream, Upstream, UpstreamHandle, UpstreamRole, Upstreams,
};
pub use error::{BackendError, ProxyError};
pub use passthrough::{PassthroughBackend, TcpUpstream};
pub use session::ConnectionSession;
pub use shutdown::{race_forced, Race, ShutdownSignal};
pub use supervisor::{ProxySupervisor, ProxySupervisorBuilder};
pub use transport::{Accept, BoundAddress, Listener};
