use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{keys, ChangeSet, Cluster, NodeRole, NodeSpec, PassContext, ResourceState, Result};
use corral_engine::{diff_by_key, object_key, CrudResource};
use corral_store::{typed, BackingStore};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{cluster_namespace, node_labels, owned_meta};

pub const ETCD_VOLUME_SIZE: &str = "10Gi";

pub fn claim_name(node: &NodeSpec) -> String { format!("etcd-{}", node.id) }

/// etcd data claims, one per master node.
pub struct EtcdClaims {
    store: Arc<dyn BackingStore>,
}

impl EtcdClaims {
    pub fn new(store: Arc<dyn BackingStore>) -> Self { Self { store } }
}

#[async_trait]
impl CrudResource<Cluster> for EtcdClaims {
    type Item = PersistentVolumeClaim;

    fn name(&self) -> &str { "etcd_claim" }

    fn store(&self) -> &dyn BackingStore { self.store.as_ref() }

    async fn current_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<PersistentVolumeClaim>> {
        let ns = cluster_namespace(cluster);
        let selector = keys::cluster_selector(cluster.cluster_id());
        Ok(typed::list::<PersistentVolumeClaim>(self.store(), Some(&ns), Some(&selector)).await?.into())
    }

    fn desired_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<PersistentVolumeClaim>> {
        let items = cluster
            .spec
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::Master)
            .map(|node| PersistentVolumeClaim {
                metadata: owned_meta(cluster, &claim_name(node), node_labels(cluster, node)),
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([("storage".to_string(), Quantity(ETCD_VOLUME_SIZE.to_string()))])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        Ok(items.into())
    }

    /// Claim specs are immutable once bound; only creates and deletes apply.
    fn update_change(
        &self,
        _pass: &PassContext,
        current: &ResourceState<PersistentVolumeClaim>,
        desired: &ResourceState<PersistentVolumeClaim>,
    ) -> Result<ChangeSet<PersistentVolumeClaim>> {
        diff_by_key(&current.items, &desired.items, object_key::<PersistentVolumeClaim>, |_, _| Ok(false))
    }
}
