//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Error taxonomy for the connection supervision core."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wirebetween_resilience::CrashError;

use crate::backend::UpstreamRole;

/// Failures reported by a backend collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connectivity probe to {address} failed: {source}")]
    Probe {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {address}")]
    Timeout { address: String },
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by [`crate::ProxySupervisor::run`] and [`crate::ConnectionAcceptor::listen`].
///
/// Only fatal startup failures and an exhausted restart budget reach the caller;
/// accept errors and session failures are absorbed where they happen.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to establish {role} upstream: {source}")]
    UpstreamConnect {
        role: UpstreamRole,
        #[source]
        source: BackendError,
    },
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to unlink stale socket {}: {source}", .path.display())]
    Unlink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serve sequence crashed {attempts} times; giving up")]
    RestartsExhausted { attempts: u32 },
    #[error("serve task failed: {0}")]
    Task(String),
}

impl ProxyError {
    /// True for errors raised before the listener started accepting.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnect { .. } | ProxyError::Bind { .. } | ProxyError::Unlink { .. }
        )
    }
}

impl From<CrashError> for ProxyError {
    fn from(err: CrashError) -> Self {
        match err {
            CrashError::RestartsExhausted { attempts } => {
                ProxyError::RestartsExhausted { attempts }
            }
            other => ProxyError::Task(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_errors_map_onto_proxy_errors() {
        let err: ProxyError = CrashError::RestartsExhausted { attempts: 4 }.into();
        assert!(matches!(err, ProxyError::RestartsExhausted { attempts: 4 }));
        let err: ProxyError = CrashError::Cancelled.into();
        assert!(matches!(err, ProxyError::Task(_)));
        assert!(!err.is_startup());
    }

    #[test]
    fn upstream_errors_name_the_role() {
        let err = ProxyError::UpstreamConnect {
            role: UpstreamRole::Failover,
            source: BackendError::Timeout {
                address: "10.0.0.9:5432".into(),
            },
        };
        assert!(err.is_startup());
        assert_eq!(
            err.to_string(),
            "failed to establish failover upstream: timed out connecting to 10.0.0.9:5432"
        );
    }
}
