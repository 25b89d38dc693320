//! Activation: scaling a workload from zero and waiting for readiness.
//!
//! One `AppActivation` exists per workload at a time; concurrent requests
//! for the same workload join the in-flight attempt. The state machine is
//! `Pending` to `Ready` (first pod ready) or `TimedOut` (deadline elapsed),
//! and terminal transitions are single-shot.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::index::App;
use super::Activator;
use crate::error::{OsirisError, Result};
use crate::k8s;
use crate::k8s::informer::{PodWatchFactory, WatchEvent};
use crate::k8s::workloads::{parse_dependencies, WorkloadClient, WorkloadRef};

/// Lifecycle of one activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Pending,
    Ready,
    TimedOut,
}

/// An in-flight activation. Waiters block on [`AppActivation::wait`]; the
/// completion watcher drives the terminal transition.
pub struct AppActivation {
    workload: WorkloadRef,
    dependencies: Vec<WorkloadRef>,
    state: watch::Sender<ActivationState>,
    ready_pod_ips: Mutex<HashSet<String>>,
}

impl AppActivation {
    pub fn new(workload: WorkloadRef, dependencies: Vec<WorkloadRef>) -> Arc<Self> {
        let (state, _) = watch::channel(ActivationState::Pending);
        Arc::new(Self {
            workload,
            dependencies,
            state,
            ready_pod_ips: Mutex::new(HashSet::new()),
        })
    }

    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    /// Co-activation targets discovered when this activation started.
    pub fn dependencies(&self) -> &[WorkloadRef] {
        &self.dependencies
    }

    pub fn state(&self) -> ActivationState {
        *self.state.borrow()
    }

    /// First pod became ready. Returns false if already terminal.
    pub fn mark_ready(&self) -> bool {
        self.transition(ActivationState::Ready)
    }

    /// Deadline elapsed. Returns false if already terminal.
    pub fn mark_timed_out(&self) -> bool {
        self.transition(ActivationState::TimedOut)
    }

    fn transition(&self, next: ActivationState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ActivationState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Block until the activation reaches a terminal state.
    pub async fn wait(&self) -> ActivationState {
        let mut rx = self.state.subscribe();
        let result = match rx.wait_for(|s| *s != ActivationState::Pending).await {
            Ok(state) => *state,
            // The sender lives in self, so this is unreachable; fail safe
            Err(_) => ActivationState::TimedOut,
        };
        result
    }

    pub fn add_ready_ip(&self, ip: &str) {
        self.ready_pod_ips.lock().unwrap().insert(ip.to_string());
    }

    pub fn remove_ready_ip(&self, ip: &str) {
        self.ready_pod_ips.lock().unwrap().remove(ip);
    }

    pub fn ready_ip_count(&self) -> usize {
        self.ready_pod_ips.lock().unwrap().len()
    }
}

/// Watch the workload's pods and race readiness against the deadline.
fn spawn_completion_watcher(
    activation: Arc<AppActivation>,
    pods: Arc<dyn PodWatchFactory>,
    selector: String,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let mut watch = pods.watch_pods(&activation.workload.namespace, &selector, cancel.clone());
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if activation.mark_timed_out() {
                        tracing::warn!(workload = %activation.workload, "activation timed out");
                    }
                    break;
                }
                event = watch.recv() => match event {
                    Some(WatchEvent::Added(pod)) | Some(WatchEvent::Updated(pod)) => {
                        if k8s::pod_is_ready(&pod) {
                            if let Some(ip) = k8s::pod_ip(&pod) {
                                activation.add_ready_ip(ip);
                            }
                            if activation.mark_ready() {
                                tracing::info!(
                                    workload = %activation.workload,
                                    "workload has a ready pod, activation complete"
                                );
                            }
                            break;
                        }
                    }
                    Some(WatchEvent::Deleted(pod)) => {
                        if let Some(ip) = k8s::pod_ip(&pod) {
                            activation.remove_ready_ip(ip);
                        }
                    }
                    None => break,
                }
            }
        }
        cancel.cancel();
    });
}

impl<C: WorkloadClient + 'static> Activator<C> {
    /// Activate the app's workload, then best-effort co-activate its
    /// declared dependencies (transitively, bounded by a visited set so
    /// cyclic declarations terminate). Dependency failures are logged and
    /// never fail the parent.
    pub(crate) async fn ensure_activation_tree(
        self: &Arc<Self>,
        app: &App,
    ) -> Result<Arc<AppActivation>> {
        let parent_ref = app.workload_ref();
        let parent = self
            .ensure_activation(&parent_ref)
            .await
            .map_err(|e| OsirisError::Activation(parent_ref.key(), e.to_string()))?;

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(parent_ref.key());
        let mut queue: VecDeque<WorkloadRef> = parent.dependencies().iter().cloned().collect();
        while let Some(dep) = queue.pop_front() {
            if !visited.insert(dep.key()) {
                continue;
            }
            match self.ensure_activation(&dep).await {
                Ok(activation) => queue.extend(activation.dependencies().iter().cloned()),
                Err(e) => {
                    tracing::error!(dependency = %dep, error = %e, "dependency activation failed");
                }
            }
        }
        Ok(parent)
    }

    /// Join the in-flight activation for the workload, or start one. The
    /// critical section covers the double-check, the workload read, the
    /// conditional scale patch and the map insertion, which is what makes
    /// the scale-up patch at-most-once across concurrent requests.
    pub(crate) async fn ensure_activation(
        self: &Arc<Self>,
        workload: &WorkloadRef,
    ) -> Result<Arc<AppActivation>> {
        let key = workload.key();
        let mut activations = self.activations.lock().await;
        if let Some(existing) = activations.get(&key) {
            tracing::info!(workload = key, "joining in-flight activation");
            return Ok(existing.clone());
        }

        let info = self.client.get_workload(workload).await?;
        let dependencies = info
            .annotations
            .get(k8s::ANN_DEPENDENCIES)
            .map(|v| parse_dependencies(k8s::clean_annotation_value(v)))
            .unwrap_or_default();

        match info.desired_replicas {
            Some(replicas) if replicas <= 0 => {
                let min = k8s::min_replicas(&info.annotations, 1);
                tracing::info!(workload = key, replicas = min, "activating workload");
                self.client.patch_replicas(workload, min).await?;
            }
            _ => {
                // Scale-up already in progress, perhaps by another activator
                // process; just watch for completion
                tracing::info!(workload = key, "workload already scaling up");
            }
        }

        let activation = AppActivation::new(workload.clone(), dependencies);
        spawn_completion_watcher(
            activation.clone(),
            self.pods.clone(),
            info.selector,
            self.activation_timeout,
        );
        activations.insert(key.clone(), activation.clone());

        // Terminal activations leave the map so the next request retries
        // from scratch
        let this = self.clone();
        let tracked = activation.clone();
        tokio::spawn(async move {
            tracked.wait().await;
            let mut activations = this.activations.lock().await;
            if let Some(current) = activations.get(&key) {
                if Arc::ptr_eq(current, &tracked) {
                    activations.remove(&key);
                }
            }
        });

        Ok(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_activator;
    use super::*;
    use crate::k8s::informer::testing::MockPodWatchFactory;
    use crate::k8s::workloads::{WorkloadInfo, WorkloadKind};
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ready_pod(name: &str, ip: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn unready_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn scaled_to_zero(annotations: &[(&str, &str)]) -> WorkloadInfo {
        WorkloadInfo {
            desired_replicas: Some(0),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            selector: "app=app".to_string(),
        }
    }

    fn app_for(workload: &WorkloadRef) -> App {
        App {
            namespace: workload.namespace.clone(),
            service_name: "svc".to_string(),
            name: workload.name.clone(),
            kind: workload.kind,
            target_url: "http://10.0.0.1:80".to_string(),
            dependencies: vec![],
        }
    }

    // --- state machine ---

    #[tokio::test]
    async fn test_terminal_transitions_are_single_shot() {
        let activation = AppActivation::new(
            WorkloadRef::new(WorkloadKind::Deployment, "ns", "app"),
            vec![],
        );
        assert_eq!(activation.state(), ActivationState::Pending);
        assert!(activation.mark_ready());
        assert!(!activation.mark_ready());
        assert!(!activation.mark_timed_out());
        assert_eq!(activation.state(), ActivationState::Ready);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_terminal() {
        let activation = AppActivation::new(
            WorkloadRef::new(WorkloadKind::Deployment, "ns", "app"),
            vec![],
        );
        activation.mark_timed_out();
        assert_eq!(activation.wait().await, ActivationState::TimedOut);
    }

    #[tokio::test]
    async fn test_wait_wakes_all_waiters() {
        let activation = AppActivation::new(
            WorkloadRef::new(WorkloadKind::Deployment, "ns", "app"),
            vec![],
        );
        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let activation = activation.clone();
                tokio::spawn(async move { activation.wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        activation.mark_ready();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), ActivationState::Ready);
        }
    }

    // --- completion watcher ---

    #[tokio::test]
    async fn test_watcher_fires_on_first_ready_pod() {
        let pods = Arc::new(MockPodWatchFactory::new());
        let activation = AppActivation::new(
            WorkloadRef::new(WorkloadKind::Deployment, "ns", "app"),
            vec![],
        );
        spawn_completion_watcher(
            activation.clone(),
            pods.clone() as Arc<dyn PodWatchFactory>,
            "app=app".to_string(),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        pods.send(WatchEvent::Added(unready_pod("web-0"))).await;
        pods.send(WatchEvent::Updated(ready_pod("web-0", "10.1.0.9"))).await;
        assert_eq!(activation.wait().await, ActivationState::Ready);
        assert_eq!(activation.ready_ip_count(), 1);
    }

    #[tokio::test]
    async fn test_watcher_times_out_without_ready_pods() {
        let pods = Arc::new(MockPodWatchFactory::new());
        let activation = AppActivation::new(
            WorkloadRef::new(WorkloadKind::Deployment, "ns", "app"),
            vec![],
        );
        spawn_completion_watcher(
            activation.clone(),
            pods.clone() as Arc<dyn PodWatchFactory>,
            "app=app".to_string(),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        pods.send(WatchEvent::Added(unready_pod("web-0"))).await;
        assert_eq!(activation.wait().await, ActivationState::TimedOut);
    }

    // --- single flight ---

    #[tokio::test]
    async fn test_concurrent_requests_issue_one_patch() {
        let (activator, client, pods) = make_activator(Duration::from_secs(300));
        let workload = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        client.set_workload(&workload, scaled_to_zero(&[(k8s::ANN_MIN_REPLICAS, "2")]));
        let app = app_for(&workload);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let activator = activator.clone();
                let app = app.clone();
                tokio::spawn(async move { activator.ensure_activation_tree(&app).await })
            })
            .collect();
        let mut activations = Vec::new();
        for task in tasks {
            activations.push(task.await.unwrap().unwrap());
        }

        // Exactly one patch, at the annotated minimum, one pod watch, and
        // every caller parked on the same activation
        assert_eq!(client.patches(), vec![("Deployment:ns/app".to_string(), 2)]);
        assert_eq!(pods.watch_count(), 1);
        assert!(activations.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_already_scaling_workload_is_not_patched() {
        let (activator, client, _pods) = make_activator(Duration::from_secs(300));
        let workload = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        client.set_workload(
            &workload,
            WorkloadInfo {
                desired_replicas: Some(1),
                ..WorkloadInfo::default()
            },
        );
        activator.ensure_activation(&workload).await.unwrap();
        assert!(client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_unset_replicas_is_treated_as_scaling() {
        let (activator, client, _pods) = make_activator(Duration::from_secs(300));
        let workload = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        client.set_workload(&workload, WorkloadInfo::default());
        activator.ensure_activation(&workload).await.unwrap();
        assert!(client.patches().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_activation_leaves_the_map() {
        let (activator, client, pods) = make_activator(Duration::from_secs(300));
        let workload = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        client.set_workload(&workload, scaled_to_zero(&[]));

        let activation = activator.ensure_activation(&workload).await.unwrap();
        assert_eq!(activator.activation_count().await, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        pods.send(WatchEvent::Added(ready_pod("web-0", "10.1.0.9"))).await;
        assert_eq!(activation.wait().await, ActivationState::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(activator.activation_count().await, 0);
    }

    // --- dependency fan-out ---

    #[tokio::test]
    async fn test_dependencies_are_co_activated() {
        let (activator, client, _pods) = make_activator(Duration::from_secs(300));
        let parent = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        let dep = WorkloadRef::new(WorkloadKind::StatefulSet, "db", "postgres");
        client.set_workload(
            &parent,
            scaled_to_zero(&[(k8s::ANN_DEPENDENCIES, "statefulset:db/postgres")]),
        );
        client.set_workload(&dep, scaled_to_zero(&[]));

        activator.ensure_activation_tree(&app_for(&parent)).await.unwrap();
        let patches = client.patches();
        assert!(patches.contains(&("Deployment:ns/app".to_string(), 1)));
        assert!(patches.contains(&("StatefulSet:db/postgres".to_string(), 1)));
    }

    #[tokio::test]
    async fn test_transitive_dependencies_and_cycles_terminate() {
        let (activator, client, _pods) = make_activator(Duration::from_secs(300));
        let parent = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        let dep1 = WorkloadRef::new(WorkloadKind::Deployment, "ns", "dep1");
        let dep2 = WorkloadRef::new(WorkloadKind::Deployment, "ns", "dep2");
        client.set_workload(
            &parent,
            scaled_to_zero(&[(k8s::ANN_DEPENDENCIES, "deployment:ns/dep1")]),
        );
        // dep1 declares dep2 and also points back at the parent
        client.set_workload(
            &dep1,
            scaled_to_zero(&[(k8s::ANN_DEPENDENCIES, "deployment:ns/dep2,deployment:ns/app")]),
        );
        client.set_workload(&dep2, scaled_to_zero(&[]));

        activator.ensure_activation_tree(&app_for(&parent)).await.unwrap();
        let mut patched: Vec<String> = client.patches().into_iter().map(|(k, _)| k).collect();
        patched.sort();
        assert_eq!(
            patched,
            vec![
                "Deployment:ns/app".to_string(),
                "Deployment:ns/dep1".to_string(),
                "Deployment:ns/dep2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dependency_failure_does_not_fail_parent() {
        let (activator, client, _pods) = make_activator(Duration::from_secs(300));
        let parent = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        let dep = WorkloadRef::new(WorkloadKind::Deployment, "ns", "broken");
        client.set_workload(
            &parent,
            scaled_to_zero(&[(k8s::ANN_DEPENDENCIES, "deployment:ns/broken")]),
        );
        client.fail(&dep);

        let result = activator.ensure_activation_tree(&app_for(&parent)).await;
        assert!(result.is_ok());
        assert_eq!(client.patches(), vec![("Deployment:ns/app".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_parent_failure_fails_the_tree() {
        let (activator, client, _pods) = make_activator(Duration::from_secs(300));
        let parent = WorkloadRef::new(WorkloadKind::Deployment, "ns", "app");
        client.fail(&parent);
        assert!(activator.ensure_activation_tree(&app_for(&parent)).await.is_err());
        assert_eq!(activator.activation_count().await, 0);
    }
}
