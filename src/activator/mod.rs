//! Activator: request-driven scale-from-zero.
//!
//! Keeps an index from every addressable host form of an endpoint-managed
//! service to the workload behind it. In-cluster traffic for a
//! scaled-to-zero workload lands here (the endpoints hijack webhook points
//! the service at this process); the activator scales the workload back up,
//! holds the request until a pod is ready, and then relays it to the
//! service's cluster IP.

mod activating;
mod config;
mod handler;
mod index;

pub use activating::{ActivationState, AppActivation};
pub use config::ActivatorConfig;
pub use index::{build_index, App, HostIndex};

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::forward::Forwarder;
use crate::healthz;
use crate::k8s::informer::{Informer, PodWatchFactory, WatchEvent};
use crate::k8s::workloads::WorkloadClient;
use crate::k8s;
use crate::server;

/// The four per-kind caches and the host index derived from them. Mutated
/// and rebuilt under one write lock; request handlers only ever clone the
/// index pointer under the read lock.
#[derive(Default)]
struct Indices {
    services: HashMap<String, Service>,
    deployments: HashMap<String, Deployment>,
    statefulsets: HashMap<String, StatefulSet>,
    node_addresses: HashMap<String, Vec<String>>,
    apps_by_host: Arc<HostIndex>,
}

/// The activator controller.
pub struct Activator<C> {
    cfg: ActivatorConfig,
    activation_timeout: Duration,
    client: Arc<C>,
    pods: Arc<dyn PodWatchFactory>,
    forwarder: Forwarder,
    indices: RwLock<Indices>,
    activations: tokio::sync::Mutex<HashMap<String, Arc<AppActivation>>>,
}

impl<C: WorkloadClient + 'static> Activator<C> {
    pub fn new(cfg: ActivatorConfig, client: Arc<C>, pods: Arc<dyn PodWatchFactory>) -> Arc<Self> {
        let timeout = Duration::from_secs(cfg.activation_timeout);
        Self::with_timeout(cfg, timeout, client, pods)
    }

    pub(crate) fn with_timeout(
        cfg: ActivatorConfig,
        activation_timeout: Duration,
        client: Arc<C>,
        pods: Arc<dyn PodWatchFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            activation_timeout,
            client,
            pods,
            forwarder: Forwarder::new(),
            indices: RwLock::new(Indices::default()),
            activations: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Run against the real cluster until cancellation.
    pub async fn run(self: Arc<Self>, kube_client: kube::Client, cancel: CancellationToken) -> Result<()> {
        tracing::info!("activator starting");
        let resync = Duration::from_secs(self.cfg.informers_resync_interval);
        let services = Informer::new(Api::<Service>::all(kube_client.clone()), "Service")
            .resync(resync)
            .spawn(cancel.child_token());
        let nodes = Informer::new(Api::<Node>::all(kube_client.clone()), "Node")
            .resync(resync)
            .spawn(cancel.child_token());
        let deployments = Informer::new(Api::<Deployment>::all(kube_client.clone()), "Deployment")
            .resync(resync)
            .spawn(cancel.child_token());
        let statefulsets = Informer::new(Api::<StatefulSet>::all(kube_client), "StatefulSet")
            .resync(resync)
            .spawn(cancel.child_token());

        let events = tokio::spawn(self.clone().process_events(
            services,
            nodes,
            deployments,
            statefulsets,
            cancel.clone(),
        ));

        let this = self.clone();
        let user_cancel = cancel.clone();
        let user_addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.proxy_port));
        let user = tokio::spawn(async move {
            let handler_state = this.clone();
            let result = server::serve("activator", user_addr, user_cancel.clone(), move |req| {
                let this = handler_state.clone();
                async move { this.handle_request(req).await }
            })
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "activator server failed");
                user_cancel.cancel();
            }
        });

        let this = self.clone();
        let internal_cancel = cancel.clone();
        let internal_addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.internal_port));
        let internal = tokio::spawn(async move {
            let handler_state = this.clone();
            let result = server::serve(
                "activator-internal",
                internal_addr,
                internal_cancel.clone(),
                move |req| {
                    let this = handler_state.clone();
                    let path = req.uri().path().to_string();
                    async move { this.handle_internal(&path) }
                },
            )
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "activator internal server failed");
                internal_cancel.cancel();
            }
        });

        let result = healthz::run_server(self.cfg.health_port, cancel.clone()).await;
        cancel.cancel();
        let _ = tokio::join!(events, user, internal);
        tracing::info!("activator stopped");
        result
    }

    /// Drain cache events; every event mutates its cache and rebuilds the
    /// host index under the write lock.
    async fn process_events(
        self: Arc<Self>,
        mut services: mpsc::Receiver<WatchEvent<Service>>,
        mut nodes: mpsc::Receiver<WatchEvent<Node>>,
        mut deployments: mpsc::Receiver<WatchEvent<Deployment>>,
        mut statefulsets: mpsc::Receiver<WatchEvent<StatefulSet>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = services.recv() => match event {
                    Some(event) => self.sync_service(event),
                    None => return,
                },
                event = nodes.recv() => match event {
                    Some(event) => self.sync_node(event),
                    None => return,
                },
                event = deployments.recv() => match event {
                    Some(event) => self.sync_deployment(event),
                    None => return,
                },
                event = statefulsets.recv() => match event {
                    Some(event) => self.sync_statefulset(event),
                    None => return,
                },
            }
        }
    }

    pub(crate) fn sync_service(&self, event: WatchEvent<Service>) {
        let mut indices = self.indices.write().unwrap();
        match event {
            WatchEvent::Added(svc) | WatchEvent::Updated(svc) => {
                let Some(key) = cache_key(&svc.metadata) else {
                    return;
                };
                let annotations = svc.metadata.annotations.clone().unwrap_or_default();
                if k8s::service_is_endpoints_managed(&annotations) {
                    indices.services.insert(key, svc);
                } else {
                    indices.services.remove(&key);
                }
            }
            WatchEvent::Deleted(svc) => {
                let Some(key) = cache_key(&svc.metadata) else {
                    return;
                };
                indices.services.remove(&key);
            }
        }
        Self::rebuild(&mut indices);
    }

    pub(crate) fn sync_node(&self, event: WatchEvent<Node>) {
        let mut indices = self.indices.write().unwrap();
        match event {
            WatchEvent::Added(node) | WatchEvent::Updated(node) => {
                let Some(name) = node.metadata.name.clone() else {
                    return;
                };
                let addresses: Vec<String> = node
                    .status
                    .as_ref()
                    .and_then(|s| s.addresses.as_ref())
                    .map(|addrs| addrs.iter().map(|a| a.address.clone()).collect())
                    .unwrap_or_default();
                indices.node_addresses.insert(name, addresses);
            }
            WatchEvent::Deleted(node) => {
                let Some(name) = node.metadata.name.as_deref() else {
                    return;
                };
                indices.node_addresses.remove(name);
            }
        }
        Self::rebuild(&mut indices);
    }

    pub(crate) fn sync_deployment(&self, event: WatchEvent<Deployment>) {
        let mut indices = self.indices.write().unwrap();
        match event {
            WatchEvent::Added(d) | WatchEvent::Updated(d) => {
                let Some(key) = cache_key(&d.metadata) else {
                    return;
                };
                indices.deployments.insert(key, d);
            }
            WatchEvent::Deleted(d) => {
                let Some(key) = cache_key(&d.metadata) else {
                    return;
                };
                indices.deployments.remove(&key);
            }
        }
        Self::rebuild(&mut indices);
    }

    pub(crate) fn sync_statefulset(&self, event: WatchEvent<StatefulSet>) {
        let mut indices = self.indices.write().unwrap();
        match event {
            WatchEvent::Added(s) | WatchEvent::Updated(s) => {
                let Some(key) = cache_key(&s.metadata) else {
                    return;
                };
                indices.statefulsets.insert(key, s);
            }
            WatchEvent::Deleted(s) => {
                let Some(key) = cache_key(&s.metadata) else {
                    return;
                };
                indices.statefulsets.remove(&key);
            }
        }
        Self::rebuild(&mut indices);
    }

    fn rebuild(indices: &mut Indices) {
        indices.apps_by_host = Arc::new(build_index(
            &indices.services,
            &indices.deployments,
            &indices.statefulsets,
            &indices.node_addresses,
        ));
    }

    /// A consistent snapshot of the host index.
    pub(crate) fn host_index(&self) -> Arc<HostIndex> {
        self.indices.read().unwrap().apps_by_host.clone()
    }

    #[cfg(test)]
    pub(crate) async fn activation_count(&self) -> usize {
        self.activations.lock().await.len()
    }
}

fn cache_key(meta: &ObjectMeta) -> Option<String> {
    Some(format!("{}/{}", meta.namespace.as_deref()?, meta.name.as_deref()?))
}
