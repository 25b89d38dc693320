//! Watch layer over the Kubernetes API.
//!
//! An [`Informer`] lists and watches one resource kind, keeps a local cache,
//! and delivers add/update/delete events to its subscriber over a bounded
//! channel. The underlying watch reconnects transparently; after any
//! disconnect (and on every resync) the subscriber observes a re-list in
//! which live objects are delivered again as adds and objects that vanished
//! while disconnected are delivered as deletes.

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single cache event delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Updated(K),
    Deleted(K),
}

/// Default interval after which the watch is restarted to force a re-list.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// A cache-backed watch on one resource kind.
pub struct Informer<K> {
    api: Api<K>,
    config: watcher::Config,
    resync: Duration,
    kind: &'static str,
}

impl<K> Informer<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Create an informer over the given API scope (single namespace or all).
    pub fn new(api: Api<K>, kind: &'static str) -> Self {
        Self {
            api,
            config: watcher::Config::default(),
            resync: DEFAULT_RESYNC,
            kind,
        }
    }

    /// Restrict the watch to objects matching a label selector.
    pub fn labels(mut self, selector: &str) -> Self {
        self.config = self.config.labels(selector);
        self
    }

    /// Restrict the watch to objects matching a field selector.
    pub fn fields(mut self, selector: &str) -> Self {
        self.config = self.config.fields(selector);
        self
    }

    /// Override the resync interval.
    pub fn resync(mut self, interval: Duration) -> Self {
        self.resync = interval;
        self
    }

    /// Start the watch. Events arrive on the returned channel until the
    /// cancellation token fires or the receiver is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> mpsc::Receiver<WatchEvent<K>> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move { self.run(tx, cancel).await });
        rx
    }

    async fn run(self, tx: mpsc::Sender<WatchEvent<K>>, cancel: CancellationToken) {
        let mut cache: HashMap<String, K> = HashMap::new();
        loop {
            let mut stream = watcher::watcher(self.api.clone(), self.config.clone()).boxed();
            let resync = tokio::time::sleep(self.resync);
            tokio::pin!(resync);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut resync => {
                        tracing::debug!(kind = self.kind, "restarting watch for resync");
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            for delivery in apply_event(&mut cache, event) {
                                if tx.send(delivery).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(kind = self.kind, error = %e, "watch error, retrying");
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

/// Cache key: `namespace/name`.
fn obj_key<K: kube::Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Apply one raw watch event to the cache and produce the deliveries the
/// subscriber should see.
fn apply_event<K>(cache: &mut HashMap<String, K>, event: Event<K>) -> Vec<WatchEvent<K>>
where
    K: kube::Resource + Clone,
{
    match event {
        Event::Applied(obj) => {
            let key = obj_key(&obj);
            if cache.insert(key, obj.clone()).is_some() {
                vec![WatchEvent::Updated(obj)]
            } else {
                vec![WatchEvent::Added(obj)]
            }
        }
        Event::Deleted(obj) => {
            cache.remove(&obj_key(&obj));
            vec![WatchEvent::Deleted(obj)]
        }
        Event::Restarted(objs) => {
            let mut fresh: HashMap<String, K> = HashMap::with_capacity(objs.len());
            let mut deliveries = Vec::with_capacity(objs.len());
            for obj in objs {
                fresh.insert(obj_key(&obj), obj.clone());
                deliveries.push(WatchEvent::Added(obj));
            }
            // Objects that disappeared while the watch was down
            for (key, old) in cache.drain() {
                if !fresh.contains_key(&key) {
                    deliveries.push(WatchEvent::Deleted(old));
                }
            }
            *cache = fresh;
            deliveries
        }
    }
}

// -----------------------------------------------------------------------
// Pod watch factory
// -----------------------------------------------------------------------

/// Capability to open a pod watch scoped to a namespace and label selector.
/// The zeroscaler's collectors and the activator's completion watchers both
/// consume pod watches through this trait so they can run against a fake
/// source in tests.
pub trait PodWatchFactory: Send + Sync {
    fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<WatchEvent<Pod>>;
}

/// Pod watches backed by the real API server.
pub struct KubePodWatchFactory {
    client: kube::Client,
    resync: Duration,
}

impl KubePodWatchFactory {
    pub fn new(client: kube::Client, resync: Duration) -> Self {
        Self { client, resync }
    }
}

impl PodWatchFactory for KubePodWatchFactory {
    fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<WatchEvent<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut informer = Informer::new(api, "Pod").resync(self.resync);
        if !label_selector.is_empty() {
            informer = informer.labels(label_selector);
        }
        informer.spawn(cancel)
    }
}
