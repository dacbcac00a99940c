//! Corral resources: handlers that converge the infrastructure objects of a
//! declared cluster, and the table wiring them into controller generations.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use corral_core::{keys, Cluster, NodeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub mod config_map;
pub mod deployment;
pub mod endpoint;
pub mod generations;
pub mod namespace;
pub mod node_index;
pub mod pvc;
pub mod rolling;
pub mod service;

pub use config_map::ConfigMaps;
pub use deployment::{Deployments, EtcdStorage};
pub use endpoint::{EndpointPhase, EndpointReconciler, EndpointRecord};
pub use generations::{cluster_router, cluster_sets, pod_router, pod_sets, POD_SELECTOR};
pub use namespace::Namespaces;
pub use node_index::NodeIndexAllocator;
pub use pvc::EtcdClaims;
pub use service::Services;

/// Every managed object of a cluster lives in the namespace named after its id.
pub fn cluster_namespace(cluster: &Cluster) -> String { cluster.cluster_id().to_string() }

pub fn cluster_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (keys::MANAGED_BY_LABEL.to_string(), keys::MANAGED_BY.to_string()),
        (keys::CLUSTER_LABEL.to_string(), cluster.cluster_id().to_string()),
    ])
}

pub fn node_labels(cluster: &Cluster, node: &NodeSpec) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(keys::NODE_LABEL.to_string(), node.id.clone());
    labels.insert(keys::ROLE_LABEL.to_string(), node.role.as_str().to_string());
    labels
}

/// Metadata for a namespaced object owned by `cluster`.
pub fn owned_meta(cluster: &Cluster, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(cluster_namespace(cluster)),
        labels: Some(labels),
        ..Default::default()
    }
}
