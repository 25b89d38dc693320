//! Zeroscaler: traffic-driven scale-to-zero.
//!
//! Watches deployments and stateful sets and keeps exactly one metrics
//! collector per workload that is scaling-enabled, has a nonzero desired
//! replica count, and is at or below its minimum replicas. Each collector
//! decides on its own when to issue the scale-to-zero patch.

mod collector;
mod config;
pub mod scraper;

pub use collector::{CollectorConfig, MetricsCollector, SCRAPE_ROUND_TIMEOUT};
pub use config::ZeroscalerConfig;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::Api;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::healthz;
use crate::k8s::informer::{Informer, PodWatchFactory, WatchEvent};
use crate::k8s::workloads::{
    state_of_deployment, state_of_stateful_set, WorkloadClient, WorkloadRef, WorkloadState,
};
use crate::k8s;
use scraper::scraper_config_from_annotations;

/// What reconciliation wants for one workload.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorDecision {
    Ensure(CollectorConfig),
    Remove,
}

/// The collector-existence rule: a collector runs iff the workload is
/// scaling-enabled, desires more than zero replicas, and is at or below its
/// minimum replica count.
pub fn reconcile_decision(state: &WorkloadState, default_interval_secs: u64) -> CollectorDecision {
    if !k8s::workload_is_scaling_enabled(&state.annotations) {
        return CollectorDecision::Remove;
    }
    let min = k8s::min_replicas(&state.annotations, 1);
    let desired = state.desired_replicas.unwrap_or(0);
    if desired > 0 && state.ready_replicas <= min {
        CollectorDecision::Ensure(CollectorConfig {
            workload: state.workload.clone(),
            selector: state.selector.clone(),
            check_interval: Duration::from_secs(k8s::metrics_check_interval_secs(
                &state.annotations,
                default_interval_secs,
            )),
            scraper: scraper_config_from_annotations(&state.annotations, &state.workload.key()),
        })
    } else {
        CollectorDecision::Remove
    }
}

struct CollectorHandle {
    config: CollectorConfig,
    cancel: CancellationToken,
    generation: u64,
}

/// The zeroscaler controller.
pub struct Zeroscaler<C> {
    cfg: ZeroscalerConfig,
    client: Arc<C>,
    pods: Arc<dyn PodWatchFactory>,
    collectors: Mutex<HashMap<String, CollectorHandle>>,
    next_generation: AtomicU64,
}

impl<C: WorkloadClient + 'static> Zeroscaler<C> {
    pub fn new(
        cfg: ZeroscalerConfig,
        client: Arc<C>,
        pods: Arc<dyn PodWatchFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            client,
            pods,
            collectors: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Run against the real cluster until cancellation.
    pub async fn run(self: Arc<Self>, kube_client: kube::Client, cancel: CancellationToken) -> Result<()> {
        tracing::info!("zeroscaler starting");
        let deployments = Informer::new(
            Api::<Deployment>::all(kube_client.clone()),
            "Deployment",
        )
        .spawn(cancel.child_token());
        let statefulsets = Informer::new(
            Api::<StatefulSet>::all(kube_client),
            "StatefulSet",
        )
        .spawn(cancel.child_token());

        let events = tokio::spawn(
            self.clone()
                .process_events(deployments, statefulsets, cancel.clone()),
        );
        let result = healthz::run_server(self.cfg.health_port, cancel.clone()).await;
        cancel.cancel();
        let _ = events.await;
        self.stop_all_collectors();
        tracing::info!("zeroscaler stopped");
        result
    }

    /// Drain workload events and reconcile. Delivery is serialized here, so
    /// collector bookkeeping never races between the two resource kinds.
    pub async fn process_events(
        self: Arc<Self>,
        mut deployments: mpsc::Receiver<WatchEvent<Deployment>>,
        mut statefulsets: mpsc::Receiver<WatchEvent<StatefulSet>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = deployments.recv() => match event {
                    Some(WatchEvent::Added(d)) | Some(WatchEvent::Updated(d)) => {
                        if let Some(state) = state_of_deployment(&d) {
                            self.sync_workload(state);
                        }
                    }
                    Some(WatchEvent::Deleted(d)) => {
                        if let Some(state) = state_of_deployment(&d) {
                            self.remove_workload(&state.workload);
                        }
                    }
                    None => return,
                },
                event = statefulsets.recv() => match event {
                    Some(WatchEvent::Added(s)) | Some(WatchEvent::Updated(s)) => {
                        if let Some(state) = state_of_stateful_set(&s) {
                            self.sync_workload(state);
                        }
                    }
                    Some(WatchEvent::Deleted(s)) => {
                        if let Some(state) = state_of_stateful_set(&s) {
                            self.remove_workload(&state.workload);
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Reconcile one workload's collector against its current state.
    pub fn sync_workload(self: &Arc<Self>, state: WorkloadState) {
        match reconcile_decision(&state, self.cfg.metrics_check_interval) {
            CollectorDecision::Ensure(config) => {
                tracing::info!(
                    kind = state.workload.kind.as_str(),
                    namespace = state.workload.namespace,
                    name = state.workload.name,
                    "workload is at or below its replica floor, ensuring metrics collection"
                );
                self.ensure_collector(config);
            }
            CollectorDecision::Remove => self.ensure_no_collector(&state.workload.key()),
        }
    }

    /// A deleted workload never keeps a collector.
    pub fn remove_workload(&self, workload: &WorkloadRef) {
        self.ensure_no_collector(&workload.key());
    }

    pub(crate) fn ensure_collector(self: &Arc<Self>, config: CollectorConfig) {
        let key = config.workload.key();
        let mut collectors = self.collectors.lock().unwrap();
        if let Some(existing) = collectors.get(&key) {
            if existing.config == config {
                tracing::debug!(workload = key, "using existing metrics collector");
                return;
            }
            tracing::info!(workload = key, "collector config changed, replacing collector");
            existing.cancel.cancel();
            collectors.remove(&key);
        }

        let collector =
            match MetricsCollector::new(config.clone(), self.client.clone(), self.pods.clone()) {
                Ok(collector) => collector,
                Err(e) => {
                    tracing::error!(workload = key, error = %e, "metrics collector can't run");
                    return;
                }
            };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let this = self.clone();
        let task_key = key.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            collector.run(task_cancel).await;
            // The collector ran to completion (scaled to zero) or was
            // cancelled; drop the map entry unless it was already replaced
            let mut collectors = this.collectors.lock().unwrap();
            if collectors.get(&task_key).map(|h| h.generation) == Some(generation) {
                collectors.remove(&task_key);
            }
        });
        collectors.insert(
            key,
            CollectorHandle {
                config,
                cancel,
                generation,
            },
        );
    }

    pub(crate) fn ensure_no_collector(&self, key: &str) {
        let mut collectors = self.collectors.lock().unwrap();
        if let Some(handle) = collectors.remove(key) {
            tracing::info!(workload = key, "stopping metrics collector");
            handle.cancel.cancel();
        }
    }

    fn stop_all_collectors(&self) {
        let mut collectors = self.collectors.lock().unwrap();
        for (_, handle) in collectors.drain() {
            handle.cancel.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn collector_count(&self) -> usize {
        self.collectors.lock().unwrap().len()
    }
}
