use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{Cluster, PassContext, ResourceState, Result};
use corral_engine::CrudResource;
use corral_store::{typed, BackingStore};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{cluster_labels, cluster_namespace};

/// The namespace holding a cluster's objects.
pub struct Namespaces {
    store: Arc<dyn BackingStore>,
}

impl Namespaces {
    pub fn new(store: Arc<dyn BackingStore>) -> Self { Self { store } }
}

#[async_trait]
impl CrudResource<Cluster> for Namespaces {
    type Item = Namespace;

    fn name(&self) -> &str { "namespace" }

    fn store(&self) -> &dyn BackingStore { self.store.as_ref() }

    async fn current_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<Namespace>> {
        let found = typed::get_opt::<Namespace>(self.store(), None, &cluster_namespace(cluster)).await?;
        Ok(found.into_iter().collect::<Vec<_>>().into())
    }

    fn desired_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<Namespace>> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(cluster_namespace(cluster)),
                labels: Some(cluster_labels(cluster)),
                ..Default::default()
            },
            ..Default::default()
        };
        Ok(ResourceState::new(vec![ns]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ClusterSpec;
    use corral_engine::{Crud, Handler};
    use corral_store::MemStore;

    #[tokio::test]
    async fn creates_once_and_deletes_on_teardown() {
        let store = Arc::new(MemStore::new());
        let handler = Crud::new(Namespaces::new(store.clone()));
        let cluster = Cluster::new("c", ClusterSpec { cluster_id: "blue".into(), schema_version: "2.0.0".into(), nodes: vec![] });

        handler.ensure_created(&PassContext::create(true), &cluster).await.unwrap();
        handler.ensure_created(&PassContext::create(true), &cluster).await.unwrap();
        assert_eq!(store.write_log(), vec!["create v1/Namespace blue".to_string()]);

        handler.ensure_deleted(&PassContext::delete(), &cluster).await.unwrap();
        assert!(typed::get_opt::<Namespace>(store.as_ref(), None, "blue").await.unwrap().is_none());
    }
}
