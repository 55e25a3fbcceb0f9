//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Two-level shutdown broadcast shared by the supervisor, acceptor, and sessions."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Level {
    fired: AtomicBool,
    token: CancellationToken,
}

impl Level {
    /// Returns `true` only for the call that performed the transition.
    fn fire(&self) -> bool {
        let first = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        // Cancelling is idempotent; every caller leaves the token cancelled on return.
        self.token.cancel();
        first
    }

    fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct Inner {
    graceful: Level,
    forced: Level,
}

/// One-shot broadcast with two independent levels: `graceful` stops new work and
/// `forced` aborts in-flight work.
///
/// Clones share state. Requests are idempotent and safe from any task or thread;
/// a waiter that starts after a level fired completes immediately.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting new work. Returns `true` for the call that made the transition.
    pub fn request_graceful(&self) -> bool {
        self.inner.graceful.fire()
    }

    /// Abort in-flight work. Graceful is always in effect before forced is broadcast,
    /// so nothing can be accepted after the first abort.
    pub fn request_forced(&self) -> bool {
        self.inner.graceful.fire();
        self.inner.forced.fire()
    }

    pub fn is_graceful_requested(&self) -> bool {
        self.inner.graceful.is_fired()
    }

    pub fn is_forced_requested(&self) -> bool {
        self.inner.forced.is_fired()
    }

    /// Resolves once graceful shutdown has been requested.
    pub async fn graceful(&self) {
        self.inner.graceful.token.cancelled().await
    }

    /// Resolves once forced shutdown has been requested.
    pub async fn forced(&self) {
        self.inner.forced.token.cancelled().await
    }

    /// A token cancelled together with the graceful level.
    pub fn graceful_token(&self) -> CancellationToken {
        self.inner.graceful.token.clone()
    }
}

/// Which side won a [`race_forced`].
#[derive(Debug, PartialEq, Eq)]
pub enum Race<T> {
    Completed(T),
    Forced,
}

/// Wait for `work` to finish unless forced shutdown fires first.
///
/// Completion is polled first, so work that is already done is never reported as forced.
pub async fn race_forced<F>(work: F, signal: &ShutdownSignal) -> Race<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = work => Race::Completed(output),
        _ = signal.forced() => Race::Forced,
    }
}
