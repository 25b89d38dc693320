//! Shared Kubernetes vocabulary: the `osiris.dm.gg/` annotation domain and
//! the small helpers every component uses to interpret it.

pub mod informer;
pub mod workloads;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

// -----------------------------------------------------------------------
// Annotation keys
// -----------------------------------------------------------------------

/// Truthy on a workload: opt the workload into zero-scaling
pub const ANN_ENABLE_SCALING: &str = "osiris.dm.gg/enableScaling";

/// Truthy on a service: opt the service into endpoint management
pub const ANN_MANAGE_ENDPOINTS: &str = "osiris.dm.gg/manageEndpoints";

/// Truthy on a pod: mark the pod eligible for sidecar injection
pub const ANN_COLLECT_METRICS: &str = "osiris.dm.gg/collectMetrics";

/// Target replica count when activating a workload (default 1)
pub const ANN_MIN_REPLICAS: &str = "osiris.dm.gg/minReplicas";

/// Idle-window length in seconds for the zeroscaler
pub const ANN_METRICS_CHECK_INTERVAL: &str = "osiris.dm.gg/metricsCheckInterval";

/// JSON `{type, implementation}` block selecting the metrics scraper
pub const ANN_METRICS_COLLECTOR: &str = "osiris.dm.gg/metricsCollector";

/// Paths that do not count as activity (consumed by the sidecar injector)
pub const ANN_IGNORED_PATHS: &str = "osiris.dm.gg/ignoredPaths";

/// On a service: name of the backing deployment
pub const ANN_DEPLOYMENT: &str = "osiris.dm.gg/deployment";

/// On a service: name of the backing stateful set
pub const ANN_STATEFULSET: &str = "osiris.dm.gg/statefulset";

/// Comma-separated `kind:namespace/name` co-activation targets
pub const ANN_DEPENDENCIES: &str = "osiris.dm.gg/dependencies";

/// Explicit ingress-default port of a service
pub const ANN_INGRESS_DEFAULT_PORT: &str = "osiris.dm.gg/ingressDefaultPort";

/// Extra host alias for any service port (`loadBalancerHostname`,
/// `loadBalancerHostname-1`, ...)
pub const ANN_LOAD_BALANCER_HOSTNAME: &str = "osiris.dm.gg/loadBalancerHostname";

/// Extra host alias for the ingress-default port (`ingressHostname`,
/// `ingressHostname-1`, ...)
pub const ANN_INGRESS_HOSTNAME: &str = "osiris.dm.gg/ingressHostname";

pub type Annotations = BTreeMap<String, String>;

// -----------------------------------------------------------------------
// Annotation interpretation
// -----------------------------------------------------------------------

fn annotation_truthy(annotations: &Annotations, key: &str) -> bool {
    match annotations.get(key) {
        Some(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "y" | "yes" | "true" | "on" | "1"
        ),
        None => false,
    }
}

/// Whether a workload has opted into zero-scaling.
pub fn workload_is_scaling_enabled(annotations: &Annotations) -> bool {
    annotation_truthy(annotations, ANN_ENABLE_SCALING)
}

/// Whether a service has opted into endpoint management.
pub fn service_is_endpoints_managed(annotations: &Annotations) -> bool {
    annotation_truthy(annotations, ANN_MANAGE_ENDPOINTS)
}

/// Whether a pod has opted into sidecar injection.
pub fn pod_collects_metrics(annotations: &Annotations) -> bool {
    annotation_truthy(annotations, ANN_COLLECT_METRICS)
}

/// The minimum number of replicas to restore on activation. Missing or
/// non-numeric annotation values yield `default`.
pub fn min_replicas(annotations: &Annotations, default: i32) -> i32 {
    annotations
        .get(ANN_MIN_REPLICAS)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// The idle-window length in seconds. Missing, non-numeric and non-positive
/// values clamp to `default`.
pub fn metrics_check_interval_secs(annotations: &Annotations, default: u64) -> u64 {
    match annotations
        .get(ANN_METRICS_CHECK_INTERVAL)
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        Some(secs) if secs > 0 => secs as u64,
        _ => default,
    }
}

/// Strip whitespace and single quotes, which show up when annotation values
/// are written through templated manifests.
pub fn clean_annotation_value(raw: &str) -> &str {
    raw.trim().trim_matches('\'')
}

/// Whether `key` is `base` or `base-<digits>` (e.g. `loadBalancerHostname-2`).
pub fn annotation_matches_indexed(key: &str, base: &str) -> bool {
    if key == base {
        return true;
    }
    match key.strip_prefix(base).and_then(|rest| rest.strip_prefix('-')) {
        Some(suffix) => !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

// -----------------------------------------------------------------------
// Keys and selectors
// -----------------------------------------------------------------------

/// The canonical `<kind>:<namespace>/<name>` key used by the zeroscaler's
/// collectors map and the activator's activations map.
pub fn workload_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}:{}/{}", kind, namespace, name)
}

/// Render a label selector's `matchLabels` as the `k=v,k=v` string the
/// Kubernetes list/watch API accepts. Expression-based selectors are not
/// used by the workloads Osiris manages.
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

// -----------------------------------------------------------------------
// Pod inspection
// -----------------------------------------------------------------------

/// Whether the pod's `Ready` condition is true.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// The pod's IP, if assigned.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}
