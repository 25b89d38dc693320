//! Sidecar proxy configuration, read from `PROXY_*` environment variables.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use crate::error::{OsirisError, Result};

/// Raw environment shape before validation.
#[derive(Debug, Clone, Deserialize)]
struct RawProxyConfig {
    /// Comma-separated `proxyPort:appPort` pairs, e.g. `8080:80,8443:8443`
    #[serde(default)]
    port_mappings: String,

    /// Comma-separated request paths that do not count as activity
    #[serde(default)]
    ignored_paths: String,

    /// Port serving `/healthz` and `/metrics`
    #[serde(default = "default_metrics_and_health_port")]
    metrics_and_health_port: u16,
}

fn default_metrics_and_health_port() -> u16 {
    5000
}

/// Validated sidecar configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listener port to application port
    pub port_mappings: HashMap<u16, u16>,
    /// Paths that do not count as activity
    pub ignored_paths: HashSet<String>,
    /// Port serving `/healthz` and `/metrics`
    pub metrics_and_health_port: u16,
}

impl ProxyConfig {
    /// Load from `PROXY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let raw: RawProxyConfig = config::Config::builder()
            .add_source(config::Environment::with_prefix("PROXY"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| OsirisError::Config(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawProxyConfig) -> Result<Self> {
        let port_mappings = parse_port_mappings(&raw.port_mappings)?;
        if port_mappings.is_empty() {
            return Err(OsirisError::Config(
                "PROXY_PORT_MAPPINGS must define at least one proxyPort:appPort pair".into(),
            ));
        }
        Ok(Self {
            port_mappings,
            ignored_paths: parse_ignored_paths(&raw.ignored_paths),
            metrics_and_health_port: raw.metrics_and_health_port,
        })
    }
}

/// Parse `proxyPort:appPort` pairs. A malformed pair is a configuration
/// error, not something to silently drop.
fn parse_port_mappings(value: &str) -> Result<HashMap<u16, u16>> {
    let mut mappings = HashMap::new();
    for pair in value.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (proxy_port, app_port) = pair.split_once(':').ok_or_else(|| {
            OsirisError::Config(format!("port mapping '{}' is not proxyPort:appPort", pair))
        })?;
        let proxy_port: u16 = proxy_port.trim().parse().map_err(|_| {
            OsirisError::Config(format!("invalid proxy port in mapping '{}'", pair))
        })?;
        let app_port: u16 = app_port.trim().parse().map_err(|_| {
            OsirisError::Config(format!("invalid application port in mapping '{}'", pair))
        })?;
        mappings.insert(proxy_port, app_port);
    }
    Ok(mappings)
}

fn parse_ignored_paths(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
