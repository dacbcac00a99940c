use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{keys, Cluster, NodeRole, PassContext, ResourceState, Result};
use corral_engine::CrudResource;
use corral_store::{typed, BackingStore};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

use crate::{cluster_labels, cluster_namespace, owned_meta};

/// Name of the role's service; also the value compute units put in their
/// endpoint service annotation.
pub fn service_name(role: NodeRole) -> &'static str { role.as_str() }

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort { name: Some(name.to_string()), port: number, protocol: Some("TCP".to_string()), ..Default::default() }
}

pub fn role_ports(role: NodeRole) -> Vec<ServicePort> {
    match role {
        NodeRole::Master => vec![port("https", 443)],
        NodeRole::Worker => vec![port("http", 80), port("https", 443)],
    }
}

/// Selector-less master and worker services; their address lists are owned by
/// the endpoint reconciler.
pub struct Services {
    store: Arc<dyn BackingStore>,
}

impl Services {
    pub fn new(store: Arc<dyn BackingStore>) -> Self { Self { store } }
}

#[async_trait]
impl CrudResource<Cluster> for Services {
    type Item = Service;

    fn name(&self) -> &str { "service" }

    fn store(&self) -> &dyn BackingStore { self.store.as_ref() }

    async fn current_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<Service>> {
        let ns = cluster_namespace(cluster);
        let selector = keys::cluster_selector(cluster.cluster_id());
        Ok(typed::list::<Service>(self.store(), Some(&ns), Some(&selector)).await?.into())
    }

    fn desired_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<Service>> {
        let items = [NodeRole::Master, NodeRole::Worker]
            .into_iter()
            .map(|role| {
                let mut labels = cluster_labels(cluster);
                labels.insert(keys::ROLE_LABEL.to_string(), role.as_str().to_string());
                Service {
                    metadata: owned_meta(cluster, service_name(role), labels),
                    spec: Some(ServiceSpec {
                        type_: Some("ClusterIP".to_string()),
                        ports: Some(role_ports(role)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            })
            .collect::<Vec<_>>();
        Ok(items.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ClusterSpec;
    use corral_engine::{Crud, Handler};
    use corral_store::MemStore;

    #[tokio::test]
    async fn services_have_no_selector_and_role_ports() {
        let store = Arc::new(MemStore::new());
        let handler = Crud::new(Services::new(store.clone()));
        let cluster = Cluster::new("c", ClusterSpec { cluster_id: "blue".into(), schema_version: "2.0.0".into(), nodes: vec![] });
        handler.ensure_created(&PassContext::create(true), &cluster).await.unwrap();

        let master: Service = typed::get(store.as_ref(), Some("blue"), "master").await.unwrap();
        let spec = master.spec.unwrap();
        assert!(spec.selector.is_none());
        assert_eq!(spec.ports.unwrap().iter().map(|p| p.port).collect::<Vec<_>>(), vec![443]);
        let worker: Service = typed::get(store.as_ref(), Some("blue"), "worker").await.unwrap();
        assert_eq!(worker.spec.unwrap().ports.unwrap().iter().map(|p| p.port).collect::<Vec<_>>(), vec![80, 443]);

        store.reset_counters();
        handler.ensure_created(&PassContext::create(true), &cluster).await.unwrap();
        assert_eq!(store.writes(), 0);
    }
}
