//! Metrics scrapers: how the zeroscaler reads a pod's request counter.
//!
//! Two interchangeable implementations behind one trait: the native scraper
//! reads the sidecar's JSON counter document, the prometheus scraper derives
//! a counter from a text exposition. New variants are registered by name in
//! [`new_scraper`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OsirisError, Result};
use crate::k8s::{self, Annotations};
use crate::metrics::ProxyRequestCount;

pub const OSIRIS_SCRAPER: &str = "osiris";
pub const PROMETHEUS_SCRAPER: &str = "prometheus";

/// The `{type, implementation}` block of the `metricsCollector` annotation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScraperConfig {
    #[serde(rename = "type")]
    pub scraper_name: String,
    #[serde(default)]
    pub implementation: Option<serde_json::Value>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            scraper_name: OSIRIS_SCRAPER.to_string(),
            implementation: None,
        }
    }
}

/// Read the scraper selection from a workload's annotations. Malformed JSON
/// falls back to the default scraper with a warning; the rest of
/// reconciliation is unaffected.
pub fn scraper_config_from_annotations(annotations: &Annotations, resource: &str) -> ScraperConfig {
    match annotations.get(k8s::ANN_METRICS_COLLECTOR) {
        None => ScraperConfig::default(),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    resource,
                    error = %e,
                    "malformed metricsCollector annotation, using the default scraper"
                );
                ScraperConfig::default()
            }
        },
    }
}

/// Read one pod's request counter. `None` means the scrape failed; the
/// collector must not make a scale decision on that tick.
#[async_trait]
pub trait MetricsScraper: Send + Sync {
    async fn scrape(&self, pod: &Pod) -> Option<ProxyRequestCount>;
}

/// Build the scraper named by the config. An unknown name is a
/// configuration error.
pub fn new_scraper(config: &ScraperConfig) -> Result<Arc<dyn MetricsScraper>> {
    match config.scraper_name.as_str() {
        OSIRIS_SCRAPER => Ok(Arc::new(OsirisScraper::from_config(config)?)),
        PROMETHEUS_SCRAPER => Ok(Arc::new(PrometheusScraper::from_config(config)?)),
        other => Err(OsirisError::UnknownScraper(other.to_string())),
    }
}

fn scrape_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .unwrap_or_default()
}

// -----------------------------------------------------------------------
// Osiris scraper
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OsirisScraperSettings {
    port: u16,
}

impl Default for OsirisScraperSettings {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

/// Reads the sidecar's canonical JSON counter document from
/// `http://<podIP>:<port>/metrics`.
pub struct OsirisScraper {
    client: reqwest::Client,
    port: u16,
}

impl OsirisScraper {
    fn from_config(config: &ScraperConfig) -> Result<Self> {
        let settings: OsirisScraperSettings = match &config.implementation {
            Some(value) => serde_json::from_value(value.clone())?,
            None => OsirisScraperSettings::default(),
        };
        Ok(Self {
            client: scrape_client(),
            port: settings.port,
        })
    }
}

#[async_trait]
impl MetricsScraper for OsirisScraper {
    async fn scrape(&self, pod: &Pod) -> Option<ProxyRequestCount> {
        let ip = k8s::pod_ip(pod)?;
        let url = format!("http://{}:{}/metrics", ip, self.port);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(pod = pod.name_any(), error = %e, "metrics scrape failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::debug!(pod = pod.name_any(), status = %resp.status(), "metrics scrape failed");
            return None;
        }
        match resp.json::<ProxyRequestCount>().await {
            Ok(prc) => Some(prc),
            Err(e) => {
                tracing::debug!(pod = pod.name_any(), error = %e, "metrics document malformed");
                None
            }
        }
    }
}

// -----------------------------------------------------------------------
// Prometheus scraper
// -----------------------------------------------------------------------

/// One metric to look up: a name plus a label subset the series must carry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricSelector {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusScraperSettings {
    #[serde(default = "default_prometheus_port")]
    port: u16,
    #[serde(default = "default_prometheus_path")]
    path: String,
    opened_connections_metric: MetricSelector,
    closed_connections_metric: MetricSelector,
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_prometheus_path() -> String {
    "/metrics".to_string()
}

/// Derives `requestCount = openedConnections - closedConnections` from a
/// Prometheus text exposition. The pod name stands in for the proxy ID: a
/// replaced pod reports under a new name, and a restarted container resets
/// its counters, so either way the collector sees activity.
pub struct PrometheusScraper {
    client: reqwest::Client,
    settings: PrometheusScraperSettings,
}

impl PrometheusScraper {
    fn from_config(config: &ScraperConfig) -> Result<Self> {
        let value = config.implementation.clone().ok_or_else(|| {
            OsirisError::Config("prometheus scraper requires an implementation block".into())
        })?;
        Ok(Self {
            client: scrape_client(),
            settings: serde_json::from_value(value)?,
        })
    }
}

#[async_trait]
impl MetricsScraper for PrometheusScraper {
    async fn scrape(&self, pod: &Pod) -> Option<ProxyRequestCount> {
        let ip = k8s::pod_ip(pod)?;
        let url = format!("http://{}:{}{}", ip, self.settings.port, self.settings.path);
        let text = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok()?,
            Ok(resp) => {
                tracing::debug!(pod = pod.name_any(), status = %resp.status(), "prometheus scrape failed");
                return None;
            }
            Err(e) => {
                tracing::debug!(pod = pod.name_any(), error = %e, "prometheus scrape failed");
                return None;
            }
        };
        let opened = metric_value(&text, &self.settings.opened_connections_metric)?;
        // A counter that has not been written yet is simply absent
        let closed = metric_value(&text, &self.settings.closed_connections_metric).unwrap_or(0.0);
        Some(ProxyRequestCount {
            proxy_id: pod.name_any(),
            request_count: (opened - closed).max(0.0) as u64,
        })
    }
}

/// Sum the samples of `selector.name` whose labels are a superset of
/// `selector.labels`. Returns `None` when no series matches.
fn metric_value(exposition: &str, selector: &MetricSelector) -> Option<f64> {
    let mut total = 0.0;
    let mut matched = false;
    for line in exposition.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((series, value)) = split_sample(line) else {
            continue;
        };
        let (name, labels) = match series.split_once('{') {
            Some((name, rest)) => match rest.strip_suffix('}') {
                Some(rest) => (name, parse_labels(rest)),
                None => continue,
            },
            None => (series, HashMap::new()),
        };
        if name != selector.name {
            continue;
        }
        if !selector
            .labels
            .iter()
            .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
        {
            continue;
        }
        let value: f64 = match value.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if value.is_nan() {
            continue;
        }
        total += value;
        matched = true;
    }
    matched.then_some(total)
}

/// Split a sample line into its series part and its value, dropping an
/// optional trailing timestamp.
fn split_sample(line: &str) -> Option<(&str, &str)> {
    // The series may contain spaces inside label values, so split from the
    // closing brace when labels are present.
    let series_end = match line.find('}') {
        Some(idx) => idx + 1,
        None => line.find(char::is_whitespace)?,
    };
    let (series, rest) = line.split_at(series_end);
    let mut fields = rest.split_whitespace();
    let value = fields.next()?;
    Some((series, value))
}

fn parse_labels(s: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for part in split_label_pairs(s) {
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim().trim_matches('"');
            labels.insert(k.trim().to_string(), v.replace("\\\"", "\""));
        }
    }
    labels
}

/// Split `k1="v1",k2="v2"` on commas outside quoted values.
fn split_label_pairs(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if in_quotes => escaped = !escaped,
            '"' if !escaped => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    if start < s.len() {
        parts.push(&s[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(name: &str, labels: &[(&str, &str)]) -> MetricSelector {
        MetricSelector {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    // --- annotation parsing ---

    #[test]
    fn test_scraper_config_default_when_missing() {
        let config = scraper_config_from_annotations(&Annotations::new(), "Deployment ns/app");
        assert_eq!(config.scraper_name, OSIRIS_SCRAPER);
        assert!(config.implementation.is_none());
    }

    #[test]
    fn test_scraper_config_malformed_falls_back() {
        let annotations: Annotations = [(
            k8s::ANN_METRICS_COLLECTOR.to_string(),
            "not-json".to_string(),
        )]
        .into_iter()
        .collect();
        let config = scraper_config_from_annotations(&annotations, "Deployment ns/app");
        assert_eq!(config, ScraperConfig::default());
    }

    #[test]
    fn test_scraper_config_parses_selection() {
        let annotations: Annotations = [(
            k8s::ANN_METRICS_COLLECTOR.to_string(),
            r#"{"type":"prometheus","implementation":{"port":9113,"openedConnectionsMetric":{"name":"nginx_connections_accepted"},"closedConnectionsMetric":{"name":"nginx_connections_handled"}}}"#
                .to_string(),
        )]
        .into_iter()
        .collect();
        let config = scraper_config_from_annotations(&annotations, "Deployment ns/app");
        assert_eq!(config.scraper_name, PROMETHEUS_SCRAPER);
        assert!(config.implementation.is_some());
    }

    // --- factory ---

    #[test]
    fn test_new_scraper_unknown_name() {
        let config = ScraperConfig {
            scraper_name: "statsd".into(),
            implementation: None,
        };
        assert!(matches!(
            new_scraper(&config),
            Err(OsirisError::UnknownScraper(_))
        ));
    }

    #[test]
    fn test_new_scraper_default_osiris() {
        assert!(new_scraper(&ScraperConfig::default()).is_ok());
    }

    #[test]
    fn test_new_scraper_prometheus_requires_implementation() {
        let config = ScraperConfig {
            scraper_name: PROMETHEUS_SCRAPER.into(),
            implementation: None,
        };
        assert!(new_scraper(&config).is_err());
    }

    // --- exposition parsing ---

    const EXPOSITION: &str = r#"
# HELP nginx_connections_accepted Accepted client connections
# TYPE nginx_connections_accepted counter
nginx_connections_accepted 1027
nginx_connections_handled 1010
http_requests_total{method="get",code="200"} 94
http_requests_total{method="post",code="200"} 6
http_requests_total{method="get",code="500"} 2 1395066363000
"#;

    #[test]
    fn test_metric_value_bare_metric() {
        let v = metric_value(EXPOSITION, &selector("nginx_connections_accepted", &[]));
        assert_eq!(v, Some(1027.0));
    }

    #[test]
    fn test_metric_value_label_filter() {
        let v = metric_value(
            EXPOSITION,
            &selector("http_requests_total", &[("method", "get"), ("code", "200")]),
        );
        assert_eq!(v, Some(94.0));
    }

    #[test]
    fn test_metric_value_sums_matching_series() {
        let v = metric_value(EXPOSITION, &selector("http_requests_total", &[("method", "get")]));
        assert_eq!(v, Some(96.0));
    }

    #[test]
    fn test_metric_value_ignores_timestamp() {
        let v = metric_value(
            EXPOSITION,
            &selector("http_requests_total", &[("code", "500")]),
        );
        assert_eq!(v, Some(2.0));
    }

    #[test]
    fn test_metric_value_absent_metric() {
        assert_eq!(metric_value(EXPOSITION, &selector("absent_metric", &[])), None);
    }

    #[test]
    fn test_metric_value_label_mismatch() {
        let v = metric_value(
            EXPOSITION,
            &selector("http_requests_total", &[("method", "delete")]),
        );
        assert_eq!(v, None);
    }

    #[test]
    fn test_parse_labels_quoted_comma() {
        let labels = parse_labels(r#"path="/a,b",method="get""#);
        assert_eq!(labels.get("path").map(String::as_str), Some("/a,b"));
        assert_eq!(labels.get("method").map(String::as_str), Some("get"));
    }

    // --- scrapers against a live endpoint ---

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_metrics_endpoint(body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn pod_with_ip(name: &str, ip: &str) -> Pod {
        use k8s_openapi::api::core::v1::PodStatus;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_osiris_scraper_reads_counter() {
        let addr = spawn_metrics_endpoint(r#"{"proxyID":"p1","requestCount":42}"#).await;
        let config = ScraperConfig {
            scraper_name: OSIRIS_SCRAPER.into(),
            implementation: Some(serde_json::json!({"port": addr.port()})),
        };
        let scraper = new_scraper(&config).unwrap();
        let prc = scraper.scrape(&pod_with_ip("web-0", "127.0.0.1")).await.unwrap();
        assert_eq!(prc.proxy_id, "p1");
        assert_eq!(prc.request_count, 42);
    }

    #[tokio::test]
    async fn test_osiris_scraper_failure_yields_none() {
        let config = ScraperConfig {
            scraper_name: OSIRIS_SCRAPER.into(),
            implementation: Some(serde_json::json!({"port": 1})),
        };
        let scraper = new_scraper(&config).unwrap();
        assert!(scraper.scrape(&pod_with_ip("web-0", "127.0.0.1")).await.is_none());
        // No IP assigned yet
        assert!(scraper.scrape(&Pod::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_prometheus_scraper_derives_count() {
        let addr = spawn_metrics_endpoint(
            "nginx_connections_accepted 1027\nnginx_connections_handled 1010\n",
        )
        .await;
        let config = ScraperConfig {
            scraper_name: PROMETHEUS_SCRAPER.into(),
            implementation: Some(serde_json::json!({
                "port": addr.port(),
                "openedConnectionsMetric": {"name": "nginx_connections_accepted"},
                "closedConnectionsMetric": {"name": "nginx_connections_handled"},
            })),
        };
        let scraper = new_scraper(&config).unwrap();
        let prc = scraper.scrape(&pod_with_ip("web-0", "127.0.0.1")).await.unwrap();
        assert_eq!(prc.proxy_id, "web-0");
        assert_eq!(prc.request_count, 17);
    }
}
