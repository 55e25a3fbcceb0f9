//! ---
//! wb_section: "01-core-functionality"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Shared primitives and utilities for the proxy runtime."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9898))
}

fn default_restart_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Primary configuration object for the proxy daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "WIREBETWEEN_CONFIG";

    /// Load configuration from disk, respecting the `WIREBETWEEN_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants across all configured proxies.
    pub fn validate(&self) -> Result<()> {
        if self.proxies.is_empty() {
            return Err(anyhow!("configuration must contain at least one proxy"));
        }
        let mut labels = HashSet::new();
        let mut addresses = HashSet::new();
        for (index, proxy) in self.proxies.iter().enumerate() {
            proxy.validate(index)?;
            if let Some(label) = &proxy.label {
                if !labels.insert(label.as_str()) {
                    return Err(anyhow!("duplicate proxy label '{}'", label));
                }
            }
            if !addresses.insert((proxy.network, proxy.address.as_str())) {
                return Err(anyhow!(
                    "listen address {} {} is configured more than once",
                    proxy.network,
                    proxy.address
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Listening transport for a proxy.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

impl Network {
    pub fn is_unix(&self) -> bool {
        matches!(self, Network::Unix)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Connection options for one upstream backend.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamOptions {
    pub address: String,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
}

impl UpstreamOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// A single proxy: one listening socket in front of a primary and optional failover upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Label scoping logs and metrics, e.g. the upstream cluster name.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub network: Network,
    pub address: String,
    /// Remove a stale unix socket file before binding.
    #[serde(default)]
    pub unlink: bool,
    /// Probe upstream connectivity while establishing the upstream handles.
    #[serde(default)]
    pub ping: bool,
    pub upstream: UpstreamOptions,
    #[serde(default)]
    pub failover: Option<UpstreamOptions>,
}

impl ProxyConfig {
    pub fn new(network: Network, address: impl Into<String>, upstream: UpstreamOptions) -> Self {
        Self {
            label: None,
            network,
            address: address.into(),
            unlink: false,
            ping: false,
            upstream,
            failover: None,
        }
    }

    /// Label used for the `cluster` log field and metric label; empty when unset.
    pub fn cluster(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    pub fn validate(&self, index: usize) -> Result<()> {
        let name = self
            .label
            .clone()
            .unwrap_or_else(|| format!("#{}", index));
        if self.address.trim().is_empty() {
            return Err(anyhow!("proxy '{}' has an empty listen address", name));
        }
        if self.network == Network::Tcp && !is_host_port(&self.address) {
            return Err(anyhow!(
                "proxy '{}' listen address '{}' is not in host:port form",
                name,
                self.address
            ));
        }
        if self.upstream.address.trim().is_empty() {
            return Err(anyhow!("proxy '{}' has an empty upstream address", name));
        }
        if let Some(failover) = &self.failover {
            if failover.address.trim().is_empty() {
                return Err(anyhow!("proxy '{}' has an empty failover address", name));
            }
            if failover.address == self.upstream.address {
                return Err(anyhow!(
                    "proxy '{}' failover address duplicates the primary upstream",
                    name
                ));
            }
        }
        Ok(())
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Command-line proxy definition: `LISTEN=UPSTREAM[,label=NAME][,failover=ADDR]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub listen: String,
    pub upstream: String,
    pub label: Option<String>,
    pub failover: Option<String>,
}

impl ProxySpec {
    pub fn into_config(self, network: Network, unlink: bool, ping: bool) -> ProxyConfig {
        ProxyConfig {
            label: self.label,
            network,
            address: self.listen,
            unlink,
            ping,
            upstream: UpstreamOptions::new(self.upstream),
            failover: self.failover.map(UpstreamOptions::new),
        }
    }
}

impl std::str::FromStr for ProxySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let head = parts.next().unwrap_or_default();
        let (listen, upstream) = head
            .split_once('=')
            .ok_or_else(|| format!("expected LISTEN=UPSTREAM, got '{}'", head))?;
        if listen.is_empty() || upstream.is_empty() {
            return Err(format!("expected LISTEN=UPSTREAM, got '{}'", head));
        }
        let mut spec = ProxySpec {
            listen: listen.to_owned(),
            upstream: upstream.to_owned(),
            label: None,
            failover: None,
        };
        for part in parts {
            match part.split_once('=') {
                Some(("label", value)) if !value.is_empty() => spec.label = Some(value.to_owned()),
                Some(("failover", value)) if !value.is_empty() => {
                    spec.failover = Some(value.to_owned())
                }
                _ => return Err(format!("unrecognised proxy option '{}'", part)),
            }
        }
        Ok(spec)
    }
}

/// Crash-restart tuning for the serve loop.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_restart_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff: Duration,
    /// `None` restarts forever.
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            backoff: default_restart_backoff(),
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
