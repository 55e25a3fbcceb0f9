//! ---
//! wb_section: "01-core-functionality"
//! wb_subsection: "binary"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Termination signal listener for the daemon."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use anyhow::{Context, Result};

/// SIGINT and SIGTERM as one stream of shutdown requests.
pub struct TerminationSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    pub fn install() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let sigterm =
                signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
            Ok(Self { sigterm })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next SIGINT or SIGTERM and return its name.
    pub async fn recv(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                ctrl_c = tokio::signal::ctrl_c() => {
                    ctrl_c.context("failed to listen for SIGINT")?;
                    Ok("SIGINT")
                }
                _ = self.sigterm.recv() => Ok("SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl+C")?;
            Ok("SIGINT")
        }
    }
}
