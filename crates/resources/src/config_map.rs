use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{keys, Cluster, NodeSpec, PassContext, ResourceState, Result};
use corral_engine::CrudResource;
use corral_store::{typed, BackingStore};
use k8s_openapi::api::core::v1::ConfigMap;

use crate::{cluster_namespace, node_labels, owned_meta};

/// Per-node configuration consumed by the compute unit at boot.
pub struct ConfigMaps {
    store: Arc<dyn BackingStore>,
    dns_servers: Vec<String>,
    ntp_servers: Vec<String>,
}

impl ConfigMaps {
    pub fn new(store: Arc<dyn BackingStore>, dns_servers: Vec<String>, ntp_servers: Vec<String>) -> Self {
        Self { store, dns_servers, ntp_servers }
    }

    fn config_map(&self, cluster: &Cluster, node: &NodeSpec) -> Result<ConfigMap> {
        let index = cluster.node_index(&node.id)?;
        let data = BTreeMap::from([
            ("cluster-id".to_string(), cluster.cluster_id().to_string()),
            ("node-id".to_string(), node.id.clone()),
            ("role".to_string(), node.role.as_str().to_string()),
            ("node-index".to_string(), index.to_string()),
            ("dns-servers".to_string(), self.dns_servers.join(",")),
            ("ntp-servers".to_string(), self.ntp_servers.join(",")),
        ]);
        Ok(ConfigMap {
            metadata: owned_meta(cluster, &node.object_name(), node_labels(cluster, node)),
            data: Some(data),
            ..Default::default()
        })
    }
}

#[async_trait]
impl CrudResource<Cluster> for ConfigMaps {
    type Item = ConfigMap;

    fn name(&self) -> &str { "config_map" }

    fn store(&self) -> &dyn BackingStore { self.store.as_ref() }

    async fn current_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<ConfigMap>> {
        let ns = cluster_namespace(cluster);
        let selector = keys::cluster_selector(cluster.cluster_id());
        Ok(typed::list::<ConfigMap>(self.store(), Some(&ns), Some(&selector)).await?.into())
    }

    fn desired_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<ConfigMap>> {
        let items = cluster.spec.nodes.iter().map(|n| self.config_map(cluster, n)).collect::<Result<Vec<_>>>()?;
        Ok(items.into())
    }
}
