//! # Osiris
//!
//! A scale-to-zero controller for Kubernetes HTTP workloads. Idle workloads
//! are scaled down to zero replicas; traffic for a scaled-to-zero workload
//! is intercepted, queued, and released once the workload is back up.
//!
//! ## Architecture
//!
//! ```text
//!              scrape /metrics                   watch + patch
//!   Sidecar  <----------------  Zeroscaler  ------------------>  API server
//!   (counts requests per pod)   (idle => replicas: 0)
//!
//!   Client -> Service (endpoints hijacked) -> Activator -> patch replicas,
//!   hold request, relay to cluster IP once a pod is Ready
//! ```
//!
//! Three long-running components share one binary:
//!
//! - **Activator**: request-driven scale-from-zero with an addressability
//!   index and at-most-one activation per workload
//! - **Zeroscaler**: traffic-driven scale-to-zero from per-pod request
//!   counters
//! - **Sidecar proxy**: per-pod request counting with a JSON counter
//!   endpoint
//!
//! Workloads opt in through annotations under the `osiris.dm.gg/` domain;
//! see [`k8s`] for the vocabulary.

pub mod activator;
pub mod error;
pub mod forward;
pub mod healthz;
pub mod k8s;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod zeroscaler;

// Re-export main types
pub use error::{OsirisError, Result};
