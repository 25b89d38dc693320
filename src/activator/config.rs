//! Activator configuration, read from `ACTIVATOR_*` environment variables.

use serde::Deserialize;

use crate::error::{OsirisError, Result};

/// Activator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivatorConfig {
    /// Seconds between forced re-lists of the watched resources
    #[serde(default = "default_resync_interval")]
    pub informers_resync_interval: u64,

    /// User-traffic port: scaled-to-zero services point here
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Liveness endpoint port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Internal-only introspection port
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Seconds a held request waits for the workload to come up
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout: u64,
}

fn default_resync_interval() -> u64 {
    300
}

fn default_proxy_port() -> u16 {
    5000
}

fn default_health_port() -> u16 {
    5001
}

fn default_internal_port() -> u16 {
    5002
}

fn default_activation_timeout() -> u64 {
    300
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            informers_resync_interval: default_resync_interval(),
            proxy_port: default_proxy_port(),
            health_port: default_health_port(),
            internal_port: default_internal_port(),
            activation_timeout: default_activation_timeout(),
        }
    }
}

impl ActivatorConfig {
    /// Load from `ACTIVATOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("ACTIVATOR"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| OsirisError::Config(e.to_string()))
    }
}
