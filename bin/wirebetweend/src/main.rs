//! ---
//! wb_section: "01-core-functionality"
//! wb_subsection: "binary"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Binary entrypoint for the wirebetween daemon."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use wirebetween_common::{
    init_tracing, install_panic_hook, AppConfig, LoadedAppConfig, LogFormat, Network, ProxySpec,
};
use wirebetween_metrics::{new_registry, spawn_http_server, DaemonMetrics, ProxyMetrics};
use wirebetween_proxy::{Backend, PassthroughBackend, ProxySupervisor};
use wirebetween_resilience::{ResilienceMetrics, RestartPolicy};

use crate::signals::TerminationSignals;

const DEFAULT_CONFIG: &str = "configs/wirebetween.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "wirebetween proxy daemon",
    long_about = "Accepts client connections on TCP or unix sockets and forwards them to a \
                  primary upstream with an optional failover. The first SIGINT/SIGTERM drains \
                  open connections; a second one aborts them."
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FORMAT", help = "Override log format (json or pretty)")]
    log_format: Option<LogFormat>,

    #[arg(
        long,
        default_value = "tcp",
        help = "Transport for proxies given on the command line (tcp or unix)"
    )]
    network: Network,

    #[arg(long, help = "Remove a stale unix socket file before binding")]
    unlink: bool,

    #[arg(long, help = "Probe upstream connectivity before listening")]
    ping: bool,

    #[arg(
        value_name = "LISTEN=UPSTREAM[,label=NAME][,failover=ADDR]",
        help = "Proxy definitions; when given they replace the proxies from the config file"
    )]
    proxies: Vec<ProxySpec>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let load_started = Instant::now();
    let loaded = load_config(&cli)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing("wirebetweend", &config.logging)?;
    install_panic_hook();
    match &loaded.source {
        Some(path) => info!(
            config_path = %path.display(),
            proxies = config.proxies.len(),
            "configuration loaded"
        ),
        None => info!(
            proxies = config.proxies.len(),
            "configuration taken from the command line"
        ),
    }

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"));

    run_daemon(config, registry).await
}

/// Resolve configuration from the environment, `--config`, the default path, and
/// positional proxy definitions, in that order of precedence for the file.
fn load_config(cli: &Cli) -> Result<LoadedAppConfig> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let env_override = std::env::var(AppConfig::ENV_CONFIG_PATH)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    let file_present = env_override || candidates.iter().any(|path| Path::new(path).exists());

    let mut loaded = if file_present || cli.proxies.is_empty() {
        AppConfig::load_with_source(&candidates)?
    } else {
        LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        }
    };

    if !cli.proxies.is_empty() {
        loaded.config.proxies = cli
            .proxies
            .iter()
            .cloned()
            .map(|spec| spec.into_config(cli.network, cli.unlink, cli.ping))
            .collect();
        loaded.config.validate()?;
    }
    Ok(loaded)
}

async fn run_daemon(
    config: AppConfig,
    registry: wirebetween_metrics::SharedRegistry,
) -> Result<()> {
    let proxy_metrics = ProxyMetrics::new(registry.clone())?;
    let resilience_metrics = ResilienceMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen).await?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let backend: Arc<dyn Backend> = Arc::new(PassthroughBackend::new());
    let policy = RestartPolicy::new(config.restart.backoff, config.restart.max_restarts);
    let supervisors: Vec<ProxySupervisor> = config
        .proxies
        .iter()
        .map(|proxy| {
            ProxySupervisor::builder(
                proxy.clone(),
                backend.clone(),
                proxy_metrics.for_cluster(proxy.cluster()),
            )
            .restart_policy(policy)
            .resilience_metrics(resilience_metrics.clone())
            .build()
        })
        .collect();

    let mut running = JoinSet::new();
    for supervisor in &supervisors {
        let supervisor = supervisor.clone();
        running.spawn(async move {
            let address = supervisor.config().address.clone();
            (address, supervisor.run().await)
        });
    }
    info!(proxies = supervisors.len(), "daemon running; waiting for termination signal");

    let mut signals = TerminationSignals::install()?;
    let mut signals_seen = 0u32;
    let mut failures = 0usize;
    loop {
        tokio::select! {
            joined = running.join_next() => match joined {
                None => break,
                Some(Ok((address, Ok(())))) => info!(address = %address, "proxy stopped"),
                Some(Ok((address, Err(err)))) => {
                    error!(address = %address, error = %err, "proxy failed; stopping the others");
                    failures += 1;
                    supervisors.iter().for_each(ProxySupervisor::request_shutdown);
                }
                Some(Err(err)) => {
                    error!(error = %err, "proxy task failed; stopping the others");
                    failures += 1;
                    supervisors.iter().for_each(ProxySupervisor::request_shutdown);
                }
            },
            received = signals.recv() => {
                let name = received?;
                signals_seen += 1;
                if signals_seen == 1 {
                    info!(signal = name, "draining open connections; repeat to abort");
                    supervisors.iter().for_each(ProxySupervisor::request_shutdown);
                } else {
                    warn!(signal = name, "aborting open connections");
                    supervisors.iter().for_each(ProxySupervisor::abort);
                }
            }
        }
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    if failures > 0 {
        return Err(anyhow!("{} proxy(ies) exited with an error", failures));
    }
    info!("daemon stopped");
    Ok(())
}
