//! ---
//! wb_section: "01-core-functionality"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Shared primitives and utilities for the proxy runtime."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
//! Core shared primitives for the wirebetween workspace.
//! This crate exposes configuration loading, validation, and tracing
//! initialisation consumed by the proxy library and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, Network, ProxyConfig, ProxySpec,
    RestartConfig, UpstreamOptions,
};
pub use logging::{init_tracing, install_panic_hook, LogFormat};
