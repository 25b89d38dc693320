//! Host index construction.
//!
//! Maps every addressable form of an endpoint-managed service (DNS names,
//! cluster IP, load-balancer IPs, annotated hostnames, node addresses with
//! node ports) to the app record that knows which workload to activate and
//! where to relay requests afterwards. The index is built from scratch on
//! every cache change and swapped in whole, so readers always see a
//! consistent snapshot.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::k8s::workloads::{parse_dependencies, WorkloadKind, WorkloadRef};
use crate::k8s::{self, Annotations};

/// The activator's record for one (service, port) pair.
#[derive(Debug, Clone, Serialize)]
pub struct App {
    pub namespace: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub name: String,
    pub kind: WorkloadKind,
    #[serde(rename = "targetURL")]
    pub target_url: String,
    pub dependencies: Vec<WorkloadRef>,
}

impl App {
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(self.kind, self.namespace.clone(), self.name.clone())
    }
}

/// Host string to app record.
pub type HostIndex = HashMap<String, Arc<App>>;

/// Build the host index from the cached services, workloads and node
/// addresses. The services map must already be filtered to endpoint-managed
/// services; caches are keyed `namespace/name`.
pub fn build_index(
    services: &HashMap<String, Service>,
    deployments: &HashMap<String, Deployment>,
    statefulsets: &HashMap<String, StatefulSet>,
    node_addresses: &HashMap<String, Vec<String>>,
) -> HostIndex {
    let mut index = HostIndex::new();
    for svc in services.values() {
        index_service(svc, deployments, statefulsets, node_addresses, &mut index);
    }
    index
}

fn index_service(
    svc: &Service,
    deployments: &HashMap<String, Deployment>,
    statefulsets: &HashMap<String, StatefulSet>,
    node_addresses: &HashMap<String, Vec<String>>,
    index: &mut HostIndex,
) {
    let Some(svc_name) = svc.metadata.name.as_deref() else {
        return;
    };
    let Some(namespace) = svc.metadata.namespace.as_deref() else {
        return;
    };
    let annotations = svc.metadata.annotations.clone().unwrap_or_default();

    // The backing workload is declared through exactly one of the two
    // workload annotations
    let (kind, workload_name) = if let Some(name) = annotations.get(k8s::ANN_DEPLOYMENT) {
        (WorkloadKind::Deployment, k8s::clean_annotation_value(name))
    } else if let Some(name) = annotations.get(k8s::ANN_STATEFULSET) {
        (WorkloadKind::StatefulSet, k8s::clean_annotation_value(name))
    } else {
        return;
    };
    if workload_name.is_empty() {
        return;
    }

    let cache_key = format!("{}/{}", namespace, workload_name);
    let workload_annotations: Option<Annotations> = match kind {
        WorkloadKind::Deployment => deployments
            .get(&cache_key)
            .map(|d| d.metadata.annotations.clone().unwrap_or_default()),
        WorkloadKind::StatefulSet => statefulsets
            .get(&cache_key)
            .map(|s| s.metadata.annotations.clone().unwrap_or_default()),
    };
    let Some(workload_annotations) = workload_annotations else {
        tracing::warn!(
            service = svc_name,
            namespace,
            kind = kind.as_str(),
            workload = workload_name,
            "backing workload not in cache yet, skipping service"
        );
        return;
    };

    let dependencies = workload_annotations
        .get(k8s::ANN_DEPENDENCIES)
        .map(|v| parse_dependencies(k8s::clean_annotation_value(v)))
        .unwrap_or_default();

    let Some(spec) = svc.spec.as_ref() else {
        return;
    };
    let Some(cluster_ip) = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
    else {
        tracing::warn!(
            service = svc_name,
            namespace,
            "service has no cluster IP, skipping"
        );
        return;
    };
    let ports = spec.ports.clone().unwrap_or_default();
    let ingress_default = ingress_default_port(&annotations, &ports);

    let dns_names = [
        format!("{}.{}", svc_name, namespace),
        format!("{}.{}.svc", svc_name, namespace),
        format!("{}.{}.svc.cluster", svc_name, namespace),
        format!("{}.{}.svc.cluster.local", svc_name, namespace),
    ];
    let lb_ips: Vec<String> = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
        .unwrap_or_default();
    let lb_hostnames = indexed_annotation_values(&annotations, k8s::ANN_LOAD_BALANCER_HOSTNAME);
    let ingress_hostnames = indexed_annotation_values(&annotations, k8s::ANN_INGRESS_HOSTNAME);

    for port in &ports {
        let app = Arc::new(App {
            namespace: namespace.to_string(),
            service_name: svc_name.to_string(),
            name: workload_name.to_string(),
            kind,
            target_url: format!("http://{}:{}", cluster_ip, port.port),
            dependencies: dependencies.clone(),
        });
        let is_default = ingress_default == Some(port.port);

        let mut aliases: Vec<String> = Vec::new();
        aliases.extend(dns_names.iter().cloned());
        aliases.push(cluster_ip.to_string());
        aliases.extend(lb_ips.iter().cloned());
        aliases.extend(lb_hostnames.iter().cloned());
        if is_default {
            aliases.extend(ingress_hostnames.iter().cloned());
        }

        for alias in aliases {
            index.insert(format!("{}:{}", alias, port.port), app.clone());
            // Requests through an ingress controller carry no port in the
            // host header; the ingress-default port claims the bare forms
            if is_default {
                index.insert(alias, app.clone());
            }
        }

        if let Some(node_port) = port.node_port.filter(|np| *np != 0) {
            for addresses in node_addresses.values() {
                for address in addresses {
                    index.insert(format!("{}:{}", address, node_port), app.clone());
                }
            }
        }
    }
}

/// Which port a portless host header should resolve to: the explicitly
/// annotated port, else the sole port, else the port named `http`, else 80
/// when exposed, else none.
fn ingress_default_port(annotations: &Annotations, ports: &[ServicePort]) -> Option<i32> {
    if let Some(value) = annotations.get(k8s::ANN_INGRESS_DEFAULT_PORT) {
        return k8s::clean_annotation_value(value).parse().ok();
    }
    if ports.len() == 1 {
        return Some(ports[0].port);
    }
    if let Some(http) = ports.iter().find(|p| p.name.as_deref() == Some("http")) {
        return Some(http.port);
    }
    if ports.iter().any(|p| p.port == 80) {
        return Some(80);
    }
    None
}

fn indexed_annotation_values(annotations: &Annotations, base: &str) -> Vec<String> {
    annotations
        .iter()
        .filter(|(key, _)| k8s::annotation_matches_indexed(key, base))
        .map(|(_, value)| k8s::clean_annotation_value(value).to_string())
        .collect()
}
