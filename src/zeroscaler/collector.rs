//! Per-workload metrics collector.
//!
//! Watches the workload's pods, scrapes every sidecar once per check
//! interval, and scales the workload to zero after one full interval with
//! no counter movement. A tick in which any scrape fails, or which blows
//! the 3-second round budget, never makes a scale decision.

use futures_util::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::scraper::{new_scraper, MetricsScraper, ScraperConfig};
use crate::error::Result;
use crate::k8s::informer::{PodWatchFactory, WatchEvent};
use crate::k8s::workloads::{WorkloadClient, WorkloadRef};

/// Upper bound on one scrape round. The decision is made fast or not at all.
pub const SCRAPE_ROUND_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything that identifies one collector. A workload event carrying a
/// different config replaces the running collector.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub workload: WorkloadRef,
    pub selector: String,
    pub check_interval: Duration,
    pub scraper: ScraperConfig,
}

/// A running collector for one workload.
pub struct MetricsCollector<C> {
    config: CollectorConfig,
    scraper: Arc<dyn MetricsScraper>,
    client: Arc<C>,
    pods: Arc<dyn PodWatchFactory>,
}

impl<C: WorkloadClient + 'static> MetricsCollector<C> {
    pub fn new(
        config: CollectorConfig,
        client: Arc<C>,
        pods: Arc<dyn PodWatchFactory>,
    ) -> Result<Self> {
        let scraper = new_scraper(&config.scraper)?;
        Ok(Self::with_scraper(config, scraper, client, pods))
    }

    pub(crate) fn with_scraper(
        config: CollectorConfig,
        scraper: Arc<dyn MetricsScraper>,
        client: Arc<C>,
        pods: Arc<dyn PodWatchFactory>,
    ) -> Self {
        Self {
            config,
            scraper,
            client,
            pods,
        }
    }

    /// Collect until the workload is scaled to zero or the token fires.
    pub async fn run(self, cancel: CancellationToken) {
        let cancel = cancel.child_token();
        let workload = &self.config.workload;
        tracing::info!(
            kind = workload.kind.as_str(),
            namespace = workload.namespace,
            name = workload.name,
            interval_secs = self.config.check_interval.as_secs_f64(),
            "starting metrics collection"
        );

        let app_pods: Arc<Mutex<HashMap<String, Pod>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut watch = self.pods.watch_pods(
            &workload.namespace,
            &self.config.selector,
            cancel.clone(),
        );
        let pods_view = app_pods.clone();
        let watch_cancel = cancel.clone();
        let watch_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    event = watch.recv() => {
                        let Some(event) = event else { break };
                        let mut pods = pods_view.lock().unwrap();
                        match event {
                            WatchEvent::Added(pod) | WatchEvent::Updated(pod) => {
                                pods.insert(pod.name_any(), pod);
                            }
                            WatchEvent::Deleted(pod) => {
                                pods.remove(&pod.name_any());
                            }
                        }
                    }
                }
            }
        });

        // Latest counter per proxy ID, kept across ticks so the total is a
        // sum over proxies rather than over pods
        let mut counts_by_proxy: HashMap<String, u64> = HashMap::new();
        let mut last_total: u64 = 0;

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; swallow it so the first
        // decision happens after one full interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot: Vec<Pod> = app_pods.lock().unwrap().values().cloned().collect();
                    let must_not_decide = self.scrape_round(&snapshot, &mut counts_by_proxy).await;
                    let total: u64 = counts_by_proxy.values().sum();
                    if !must_not_decide && total == last_total {
                        if self.scale_to_zero().await.is_ok() {
                            break;
                        }
                        // Scale failed; keep collecting, the next idle tick retries
                    }
                    last_total = total;
                }
            }
        }

        cancel.cancel();
        let _ = watch_task.await;
        tracing::info!(
            kind = workload.kind.as_str(),
            namespace = workload.namespace,
            name = workload.name,
            "stopped metrics collection"
        );
    }

    /// Scrape every pod in parallel, bounded by [`SCRAPE_ROUND_TIMEOUT`].
    /// Returns true when the tick must not make a scale decision.
    async fn scrape_round(
        &self,
        pods: &[Pod],
        counts_by_proxy: &mut HashMap<String, u64>,
    ) -> bool {
        let scrapes = pods.iter().map(|pod| self.scraper.scrape(pod));
        match tokio::time::timeout(SCRAPE_ROUND_TIMEOUT, join_all(scrapes)).await {
            Ok(results) => {
                let mut must_not_decide = false;
                for result in results {
                    match result {
                        Some(prc) => {
                            counts_by_proxy.insert(prc.proxy_id, prc.request_count);
                        }
                        None => must_not_decide = true,
                    }
                }
                must_not_decide
            }
            Err(_) => {
                tracing::warn!(
                    workload = %self.config.workload,
                    "scrape round exceeded its time budget"
                );
                true
            }
        }
    }

    async fn scale_to_zero(&self) -> Result<()> {
        let workload = &self.config.workload;
        tracing::info!(
            kind = workload.kind.as_str(),
            namespace = workload.namespace,
            name = workload.name,
            "workload is idle, scaling to zero"
        );
        match self.client.patch_replicas(workload, 0).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    kind = workload.kind.as_str(),
                    namespace = workload.namespace,
                    name = workload.name,
                    error = %e,
                    "failed to scale workload to zero"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::informer::testing::MockPodWatchFactory;
    use crate::k8s::workloads::testing::MockWorkloadClient;
    use crate::k8s::workloads::WorkloadKind;
    use crate::metrics::ProxyRequestCount;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::VecDeque;

    /// Scraper returning a scripted sequence of responses per pod name;
    /// repeats the last entry once the script runs out.
    struct ScriptedScraper {
        scripts: Mutex<HashMap<String, VecDeque<Option<ProxyRequestCount>>>>,
    }

    impl ScriptedScraper {
        fn new(scripts: &[(&str, Vec<Option<(&str, u64)>>)]) -> Arc<Self> {
            let scripts = scripts
                .iter()
                .map(|(pod, responses)| {
                    let queue = responses
                        .iter()
                        .map(|r| {
                            r.map(|(id, count)| ProxyRequestCount {
                                proxy_id: id.to_string(),
                                request_count: count,
                            })
                        })
                        .collect();
                    (pod.to_string(), queue)
                })
                .collect();
            Arc::new(Self {
                scripts: Mutex::new(scripts),
            })
        }
    }

    #[async_trait]
    impl MetricsScraper for ScriptedScraper {
        async fn scrape(&self, pod: &Pod) -> Option<ProxyRequestCount> {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.get_mut(&pod.name_any())?;
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().flatten()
            }
        }
    }

    fn make_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn make_config(interval_ms: u64) -> CollectorConfig {
        CollectorConfig {
            workload: WorkloadRef::new(WorkloadKind::Deployment, "ns", "app"),
            selector: "app=app".to_string(),
            check_interval: Duration::from_millis(interval_ms),
            scraper: ScraperConfig::default(),
        }
    }

    struct Harness {
        client: Arc<MockWorkloadClient>,
        pods: Arc<MockPodWatchFactory>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start_collector(
        scraper: Arc<dyn MetricsScraper>,
        pod_names: &[&str],
        interval_ms: u64,
    ) -> Harness {
        let client = Arc::new(MockWorkloadClient::new());
        let pods = Arc::new(MockPodWatchFactory::new());
        let collector = MetricsCollector::with_scraper(
            make_config(interval_ms),
            scraper,
            client.clone(),
            pods.clone() as Arc<dyn PodWatchFactory>,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(cancel.clone()));
        // Let the collector open its pod watch, then feed the pod set
        tokio::time::sleep(Duration::from_millis(10)).await;
        for name in pod_names {
            pods.send(WatchEvent::Added(make_pod(name))).await;
        }
        Harness {
            client,
            pods,
            cancel,
            task,
        }
    }

    #[tokio::test]
    async fn test_stable_counter_scales_to_zero() {
        let scraper = ScriptedScraper::new(&[("web-0", vec![Some(("p1", 42))])]);
        let h = start_collector(scraper, &["web-0"], 30).await;
        // Tick 1 observes 42 != 0; tick 2 observes 42 == 42 and scales
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("collector should finish after the idle tick")
            .unwrap();
        assert_eq!(h.client.patches(), vec![("Deployment:ns/app".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_never_used_workload_scales_on_first_clean_tick() {
        let scraper = ScriptedScraper::new(&[("web-0", vec![Some(("p1", 0))])]);
        let h = start_collector(scraper, &["web-0"], 30).await;
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("collector should finish on the first clean tick")
            .unwrap();
        assert_eq!(h.client.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_scrape_gates_the_decision() {
        let scraper = ScriptedScraper::new(&[("web-0", vec![None])]);
        let h = start_collector(scraper, &["web-0"], 30).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.client.patches().is_empty());
        h.cancel.cancel();
        let _ = h.task.await;
    }

    #[tokio::test]
    async fn test_moving_counter_defers_scaling() {
        let scraper = ScriptedScraper::new(&[(
            "web-0",
            vec![
                Some(("p1", 1)),
                Some(("p1", 2)),
                Some(("p1", 3)),
                Some(("p1", 4)),
                Some(("p1", 5)),
                Some(("p1", 6)),
            ],
        )]);
        let h = start_collector(scraper, &["web-0"], 40).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.client.patches().is_empty());
        h.cancel.cancel();
        let _ = h.task.await;
    }

    #[tokio::test]
    async fn test_counts_aggregate_by_proxy_id() {
        // Two pods reporting under one proxy ID must not double-count; the
        // stable total scales to zero on the second tick
        let scraper = ScriptedScraper::new(&[
            ("web-0", vec![Some(("p1", 10))]),
            ("web-1", vec![Some(("p1", 10))]),
        ]);
        let h = start_collector(scraper, &["web-0", "web-1"], 30).await;
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("stable aggregate should scale to zero")
            .unwrap();
        assert_eq!(h.client.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_restart_reads_as_activity() {
        // Same counter value under a fresh proxy ID changes the aggregate,
        // so the tick after the restart must not scale
        let scraper = ScriptedScraper::new(&[(
            "web-0",
            vec![Some(("p1", 42)), Some(("p2", 42)), Some(("p2", 42))],
        )]);
        let h = start_collector(scraper, &["web-0"], 60).await;
        // Ticks: 42 (p1) -> total 42; restart: p2 joins -> total 84, no
        // decision; only once p2 is stable does it scale
        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(h.client.patches().is_empty());
        h.cancel.cancel();
        let _ = h.task.await;
    }

    #[tokio::test]
    async fn test_empty_pod_set_counts_as_idle() {
        let scraper = ScriptedScraper::new(&[]);
        let h = start_collector(scraper, &[], 30).await;
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("collector with no pods should scale to zero")
            .unwrap();
        assert_eq!(h.client.patches().len(), 1);
        drop(h.pods);
    }

    #[tokio::test]
    async fn test_failed_patch_retries_on_next_tick() {
        let scraper = ScriptedScraper::new(&[("web-0", vec![Some(("p1", 0))])]);
        let client = Arc::new(MockWorkloadClient::new());
        let wref = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        client.fail(&wref);
        let pods = Arc::new(MockPodWatchFactory::new());
        let collector = MetricsCollector::with_scraper(
            make_config(30),
            scraper,
            client.clone(),
            pods.clone() as Arc<dyn PodWatchFactory>,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        pods.send(WatchEvent::Added(make_pod("web-0"))).await;
        // Patches keep failing; the collector must stay alive and keep trying
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_collector() {
        let scraper = ScriptedScraper::new(&[("web-0", vec![None])]);
        let h = start_collector(scraper, &["web-0"], 1000).await;
        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .expect("collector should stop on cancellation")
            .unwrap();
        assert!(h.client.patches().is_empty());
    }
}
