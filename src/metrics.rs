//! Wire format shared between the sidecar proxy and the zeroscaler

use serde::{Deserialize, Serialize};

/// The per-sidecar request counter as reported on `GET /metrics`.
///
/// `proxy_id` is a fresh UUID per sidecar process; `request_count` only
/// resets when the process restarts. A restart therefore shows up as a new
/// proxy ID, or as the same ID with a strictly lower count, and either is
/// treated as activity by the zeroscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequestCount {
    /// Unique ID of the reporting sidecar process
    #[serde(rename = "proxyID")]
    pub proxy_id: String,
    /// Number of non-ignored requests seen since the process started
    #[serde(rename = "requestCount")]
    pub request_count: u64,
}
