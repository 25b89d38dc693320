//! Workload identity and the client capability used to read and scale
//! deployments and stateful sets.
//!
//! `WorkloadClient` is the only write path to the orchestrator: both the
//! zeroscaler (scale to zero) and the activator (scale back up) go through
//! it, always as a JSON-patch `replace /spec/replicas`.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::{Api, Patch, PatchParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use super::{selector_string, workload_key, Annotations};
use crate::error::Result;

/// The two workload kinds Osiris can scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
        }
    }

    /// Parse a kind name case-insensitively, as written in the
    /// `dependencies` annotation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "deployment" => Some(Self::Deployment),
            "statefulset" => Some(Self::StatefulSet),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to one scalable workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The canonical `<kind>:<namespace>/<name>` key.
    pub fn key(&self) -> String {
        workload_key(self.kind.as_str(), &self.namespace, &self.name)
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Parse the `dependencies` annotation: comma-separated
/// `<kind>:<namespace>/<name>` items. Invalid items are logged and skipped.
pub fn parse_dependencies(value: &str) -> Vec<WorkloadRef> {
    let mut refs = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match parse_dependency(item) {
            Some(wref) => refs.push(wref),
            None => {
                tracing::error!(dependency = item, "invalid dependency annotation item, skipping");
            }
        }
    }
    refs
}

fn parse_dependency(item: &str) -> Option<WorkloadRef> {
    let (kind, rest) = item.split_once(':')?;
    let kind = WorkloadKind::parse(kind)?;
    let (namespace, name) = rest.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(WorkloadRef::new(kind, namespace, name))
}

/// A point-in-time view of a workload as mirrored from the cache, carrying
/// exactly the attributes the zeroscaler's reconciliation consumes.
#[derive(Debug, Clone)]
pub struct WorkloadState {
    pub workload: WorkloadRef,
    pub annotations: Annotations,
    pub desired_replicas: Option<i32>,
    pub ready_replicas: i32,
    pub selector: String,
}

/// Build a [`WorkloadState`] from a cached deployment. Readiness uses the
/// available-replica count, matching what the deployment controller reports.
pub fn state_of_deployment(deployment: &Deployment) -> Option<WorkloadState> {
    let name = deployment.metadata.name.clone()?;
    let namespace = deployment.metadata.namespace.clone()?;
    Some(WorkloadState {
        workload: WorkloadRef::new(WorkloadKind::Deployment, namespace, name),
        annotations: deployment.metadata.annotations.clone().unwrap_or_default(),
        desired_replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
        ready_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0),
        selector: deployment
            .spec
            .as_ref()
            .map(|s| selector_string(&s.selector))
            .unwrap_or_default(),
    })
}

/// Build a [`WorkloadState`] from a cached stateful set.
pub fn state_of_stateful_set(set: &StatefulSet) -> Option<WorkloadState> {
    let name = set.metadata.name.clone()?;
    let namespace = set.metadata.namespace.clone()?;
    Some(WorkloadState {
        workload: WorkloadRef::new(WorkloadKind::StatefulSet, namespace, name),
        annotations: set.metadata.annotations.clone().unwrap_or_default(),
        desired_replicas: set.spec.as_ref().and_then(|s| s.replicas),
        ready_replicas: set
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
        selector: set
            .spec
            .as_ref()
            .map(|s| selector_string(&s.selector))
            .unwrap_or_default(),
    })
}

/// The attributes of a live workload read at activation time.
#[derive(Debug, Clone, Default)]
pub struct WorkloadInfo {
    pub desired_replicas: Option<i32>,
    pub annotations: Annotations,
    pub selector: String,
}

/// Read and scale workloads.
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Read the current state of a workload from the API server.
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<WorkloadInfo>;

    /// Issue a JSON-patch `replace /spec/replicas` with the given value.
    async fn patch_replicas(&self, workload: &WorkloadRef, replicas: i32) -> Result<()>;
}

/// Workload access backed by the real API server.
pub struct KubeWorkloadClient {
    client: kube::Client,
}

impl KubeWorkloadClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn replicas_patch(replicas: i32) -> Result<json_patch::Patch> {
        let patch = serde_json::from_value(json!([
            {"op": "replace", "path": "/spec/replicas", "value": replicas}
        ]))?;
        Ok(patch)
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<WorkloadInfo> {
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let deployment = api.get(&workload.name).await?;
                Ok(WorkloadInfo {
                    desired_replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
                    annotations: deployment.metadata.annotations.unwrap_or_default(),
                    selector: deployment
                        .spec
                        .as_ref()
                        .map(|s| selector_string(&s.selector))
                        .unwrap_or_default(),
                })
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let set = api.get(&workload.name).await?;
                Ok(WorkloadInfo {
                    desired_replicas: set.spec.as_ref().and_then(|s| s.replicas),
                    annotations: set.metadata.annotations.unwrap_or_default(),
                    selector: set
                        .spec
                        .as_ref()
                        .map(|s| selector_string(&s.selector))
                        .unwrap_or_default(),
                })
            }
        }
    }

    async fn patch_replicas(&self, workload: &WorkloadRef, replicas: i32) -> Result<()> {
        let patch = Self::replicas_patch(replicas)?;
        let params = PatchParams::default();
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Json::<()>(patch))
                    .await?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Json::<()>(patch))
                    .await?;
            }
        }
        tracing::info!(
            kind = workload.kind.as_str(),
            namespace = workload.namespace,
            name = workload.name,
            replicas,
            "patched workload replicas"
        );
        Ok(())
    }
}
