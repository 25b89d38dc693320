//! Zeroscaler configuration, read from `ZEROSCALER_*` environment variables.

use serde::Deserialize;

use crate::error::{OsirisError, Result};

/// Zeroscaler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ZeroscalerConfig {
    /// Default idle-window length in seconds, used when a workload does not
    /// carry a valid `metricsCheckInterval` annotation
    #[serde(default = "default_metrics_check_interval")]
    pub metrics_check_interval: u64,

    /// Liveness endpoint port
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_metrics_check_interval() -> u64 {
    150
}

fn default_health_port() -> u16 {
    5000
}

impl Default for ZeroscalerConfig {
    fn default() -> Self {
        Self {
            metrics_check_interval: default_metrics_check_interval(),
            health_port: default_health_port(),
        }
    }
}

impl ZeroscalerConfig {
    /// Load from `ZEROSCALER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("ZEROSCALER"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| OsirisError::Config(e.to_string()))
    }
}
