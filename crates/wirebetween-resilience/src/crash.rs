//! ---
//! wb_section: "07-resilience-fault-tolerance"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Crash isolation and restart supervision."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::ResilienceMetrics;

/// Backoff between a crash and the next attempt when no policy is configured.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Policy parameters controlling restart attempts and scheduling.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Fixed delay between a crash and the restart.
    pub backoff: Duration,
    /// Maximum number of restarts; `None` restarts forever.
    pub max_restarts: Option<u32>,
    /// Maximum jitter added to each delay.
    pub jitter: Duration,
}

impl RestartPolicy {
    /// Construct a policy with a fixed backoff and an optional restart cap.
    pub fn new(backoff: Duration, max_restarts: Option<u32>) -> Self {
        Self {
            backoff,
            max_restarts,
            jitter: Duration::ZERO,
        }
    }

    /// Add random jitter on top of the fixed backoff.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn delay(&self, rng: &mut StdRng) -> Duration {
        if self.jitter.is_zero() {
            self.backoff
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            self.backoff + Duration::from_millis(jitter_ms)
        }
    }

    fn allows_restart(&self, restarts_so_far: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts_so_far < max)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_BACKOFF, None)
    }
}

/// Failures raised by the supervisor itself rather than by the serve sequence.
#[derive(Debug, Error)]
pub enum CrashError {
    /// The serve sequence kept crashing after the configured number of restarts.
    #[error("serve sequence crashed {attempts} times; giving up")]
    RestartsExhausted {
        /// Total number of attempts that crashed.
        attempts: u32,
    },
    /// The serve task was cancelled, typically because the runtime is shutting down.
    #[error("serve task was cancelled")]
    Cancelled,
}

/// A single observed crash.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// Zero for the initial run, then one per restart.
    pub attempt: u32,
    /// Panic payload rendered as text.
    pub message: String,
    /// Wall-clock time the crash was observed.
    pub at: DateTime<Utc>,
}

impl CrashReport {
    fn from_panic(attempt: u32, payload: Box<dyn Any + Send>) -> Self {
        Self {
            attempt,
            message: panic_message(payload.as_ref()),
            at: Utc::now(),
        }
    }
}

/// Render a panic payload the way the default hook does.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs a serve sequence on its own task and restarts it after unexpected panics.
///
/// An attempt that returns `Ok(())` ended deliberately and so does an `Err`,
/// which is handed back without a restart. A panic is logged as `Crashed` and
/// followed by a backoff sleep and a fresh attempt.
#[derive(Debug)]
pub struct CrashSupervisor {
    cluster: String,
    policy: RestartPolicy,
    metrics: Option<ResilienceMetrics>,
    shutdown: Option<CancellationToken>,
    rng: StdRng,
    crashes: Mutex<Vec<CrashReport>>,
}

impl CrashSupervisor {
    /// Create a supervisor for the named cluster.
    pub fn new(
        cluster: impl Into<String>,
        policy: RestartPolicy,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            policy,
            metrics,
            shutdown: None,
            rng: StdRng::seed_from_u64(0x5EED_u64),
            crashes: Mutex::new(Vec::new()),
        }
    }

    /// Skip pending restarts once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Crashes observed so far, oldest first.
    pub fn crashes(&self) -> Vec<CrashReport> {
        self.crashes.lock().clone()
    }

    /// Drive `serve` until it returns. The closure receives the attempt number
    /// (0 for the initial run) and must build a fresh sequence each time.
    pub async fn run<F, Fut, E>(&mut self, mut serve: F) -> Result<(), E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: From<CrashError> + Display + Send + 'static,
    {
        let cluster = self.cluster.clone();
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::spawn(serve(attempt)).await;
            let join_err = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    if attempt > 0 {
                        error!(cluster = %cluster, attempt, error = %err, "Error restarting");
                    }
                    return Err(err);
                }
                Err(join_err) => join_err,
            };
            if !join_err.is_panic() {
                return Err(CrashError::Cancelled.into());
            }

            let report = CrashReport::from_panic(attempt, join_err.into_panic());
            error!(cluster = %cluster, attempt, panic = %report.message, "Crashed");
            self.crashes.lock().push(report);
            if let Some(metrics) = &self.metrics {
                metrics.record_crash(&cluster);
            }

            if !self.policy.allows_restart(attempt) {
                error!(cluster = %cluster, attempts = attempt + 1, "restart budget exhausted");
                return Err(CrashError::RestartsExhausted {
                    attempts: attempt + 1,
                }
                .into());
            }

            let delay = self.policy.delay(&mut self.rng);
            if self.wait_backoff(delay).await {
                info!(cluster = %cluster, "shutdown requested during restart backoff");
                return Ok(());
            }

            attempt += 1;
            info!(cluster = %cluster, attempt, sleep = ?delay, "Restarting");
            if let Some(metrics) = &self.metrics {
                metrics.record_restart(&cluster);
            }
        }
    }

    /// Sleep for `delay`; returns `true` if shutdown was requested first.
    async fn wait_backoff(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = sleep(delay) => false,
                }
            }
            None => {
                sleep(delay).await;
                false
            }
        }
    }
}
