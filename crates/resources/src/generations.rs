//! Per-generation handler table.
//!
//! Generation 1 (`>=1.0.0, <2.0.0`) keeps etcd on the host; generation 2
//! (`>=2.0.0, <3.0.0`) moves it onto per-master claims. Both share one
//! parameterized handler set.

use std::sync::Arc;

use corral_core::{Cluster, ControllerConfig, Result};
use corral_engine::{wrap, Crud, GenerationRouter, ResourceSet, RetryConfig};
use corral_store::BackingStore;
use k8s_openapi::api::core::v1::Pod;

use crate::{ConfigMaps, Deployments, EndpointReconciler, EtcdClaims, EtcdStorage, Namespaces, NodeIndexAllocator, Services};

/// Label selector for the compute units the endpoint controller watches.
pub const POD_SELECTOR: &str = "app.kubernetes.io/managed-by=corral";

const GENERATIONS: [(&str, &str, EtcdStorage); 2] =
    [("v1", ">=1.0.0, <2.0.0", EtcdStorage::HostPath), ("v2", ">=2.0.0, <3.0.0", EtcdStorage::Claim)];

pub fn cluster_sets(store: Arc<dyn BackingStore>, cfg: &ControllerConfig) -> Result<Vec<ResourceSet<Cluster>>> {
    let retry = RetryConfig::from(&cfg.retry);
    GENERATIONS
        .iter()
        .map(|(name, versions, etcd)| -> Result<ResourceSet<Cluster>> {
            let mut set = ResourceSet::for_versions(name, versions)?
                .with_handler(wrap(Crud::new(Namespaces::new(store.clone())), &retry))
                .with_handler(wrap(NodeIndexAllocator::new(store.clone()), &retry))
                .with_handler(wrap(
                    Crud::new(ConfigMaps::new(store.clone(), cfg.dns_servers.clone(), cfg.ntp_servers.clone())),
                    &retry,
                ))
                .with_handler(wrap(Crud::new(Services::new(store.clone())), &retry));
            if *etcd == EtcdStorage::Claim {
                set = set.with_handler(wrap(Crud::new(EtcdClaims::new(store.clone())), &retry));
            }
            Ok(set.with_handler(wrap(Crud::new(Deployments::new(store.clone(), &cfg.vm_image, *etcd)), &retry)))
        })
        .collect()
}

/// Compute units route by the version label their generation stamped on them.
pub fn pod_sets(store: Arc<dyn BackingStore>, cfg: &ControllerConfig) -> Result<Vec<ResourceSet<Pod>>> {
    let retry = RetryConfig::from(&cfg.retry);
    GENERATIONS
        .iter()
        .map(|(name, versions, _)| -> Result<ResourceSet<Pod>> {
            Ok(ResourceSet::for_versions(name, versions)?.with_handler(wrap(EndpointReconciler::new(store.clone()), &retry)))
        })
        .collect()
}

pub fn cluster_router(store: Arc<dyn BackingStore>, cfg: &ControllerConfig) -> Result<GenerationRouter<Cluster>> {
    Ok(GenerationRouter::new(cluster_sets(store, cfg)?))
}

pub fn pod_router(store: Arc<dyn BackingStore>, cfg: &ControllerConfig) -> Result<GenerationRouter<Pod>> {
    Ok(GenerationRouter::new(pod_sets(store, cfg)?))
}
