//! One single-replica Deployment per declared node, running the node's VM.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{keys, ChangeSet, Cluster, Error, NodeRole, NodeSpec, PassContext, ResourceState, Result};
use corral_engine::{diff_by_key, object_key, CrudResource};
use corral_store::{typed, BackingStore};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::pvc::claim_name;
use crate::rolling::gate_updates;
use crate::service::service_name;
use crate::{cluster_namespace, node_labels, owned_meta};

/// Where master nodes keep etcd data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtcdStorage {
    /// Directory on the hosting machine.
    HostPath,
    /// The node's `etcd-<id>` claim.
    Claim,
}

pub struct Deployments {
    store: Arc<dyn BackingStore>,
    image: String,
    etcd: EtcdStorage,
}

impl Deployments {
    pub fn new(store: Arc<dyn BackingStore>, image: &str, etcd: EtcdStorage) -> Self {
        Self { store, image: image.to_string(), etcd }
    }

    fn etcd_volume(&self, cluster: &Cluster, node: &NodeSpec) -> Volume {
        match self.etcd {
            EtcdStorage::HostPath => Volume {
                name: "etcd".into(),
                host_path: Some(HostPathVolumeSource {
                    path: format!("/var/lib/corral/{}/{}/etcd", cluster.cluster_id(), node.id),
                    type_: Some("DirectoryOrCreate".into()),
                }),
                ..Default::default()
            },
            EtcdStorage::Claim => Volume {
                name: "etcd".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: claim_name(node), read_only: None }),
                ..Default::default()
            },
        }
    }

    fn deployment(&self, cluster: &Cluster, node: &NodeSpec) -> Result<Deployment> {
        let memory = node.memory_bytes()?;
        if node.cpus == 0 {
            return Err(Error::validation(format!("node {} declares zero cpus", node.id)));
        }
        let version = cluster.spec.schema_version.clone();
        let name = node.object_name();
        let selector = node_labels(cluster, node);
        let mut pod_labels = selector.clone();
        pod_labels.insert(keys::VERSION_LABEL.to_string(), version.clone());

        let mut volumes = vec![Volume {
            name: "config".into(),
            config_map: Some(ConfigMapVolumeSource { name: Some(name.clone()), ..Default::default() }),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount { name: "config".into(), mount_path: "/etc/corral".into(), ..Default::default() }];
        if node.role == NodeRole::Master {
            volumes.push(self.etcd_volume(cluster, node));
            mounts.push(VolumeMount { name: "etcd".into(), mount_path: "/var/lib/etcd".into(), ..Default::default() });
        }

        let requests = BTreeMap::from([
            ("cpu".to_string(), Quantity(node.cpus.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]);
        let container = Container {
            name: "k8s-vm".into(),
            image: Some(self.image.clone()),
            env: Some(vec![
                EnvVar { name: "CORES".into(), value: Some(node.cpus.to_string()), ..Default::default() },
                EnvVar { name: "MEMORY_BYTES".into(), value: Some(memory.to_string()), ..Default::default() },
                EnvVar { name: "ROLE".into(), value: Some(node.role.as_str().to_string()), ..Default::default() },
            ]),
            resources: Some(ResourceRequirements { requests: Some(requests.clone()), limits: Some(requests), ..Default::default() }),
            security_context: Some(SecurityContext { privileged: Some(true), ..Default::default() }),
            volume_mounts: Some(mounts),
            ..Default::default()
        };

        let mut metadata = owned_meta(cluster, &name, node_labels(cluster, node));
        metadata.annotations = Some(BTreeMap::from([(keys::VERSION_ANNOTATION.to_string(), version)]));
        Ok(Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
                strategy: Some(DeploymentStrategy { type_: Some("Recreate".into()), ..Default::default() }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([(
                            keys::ENDPOINT_SERVICE_ANNOTATION.to_string(),
                            service_name(node.role).to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec { containers: vec![container], volumes: Some(volumes), ..Default::default() }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl CrudResource<Cluster> for Deployments {
    type Item = Deployment;

    fn name(&self) -> &str { "deployment" }

    fn store(&self) -> &dyn BackingStore { self.store.as_ref() }

    async fn current_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<Deployment>> {
        let ns = cluster_namespace(cluster);
        let selector = keys::cluster_selector(cluster.cluster_id());
        Ok(typed::list::<Deployment>(self.store(), Some(&ns), Some(&selector)).await?.into())
    }

    fn desired_state(&self, _pass: &PassContext, cluster: &Cluster) -> Result<ResourceState<Deployment>> {
        let items = cluster.spec.nodes.iter().map(|n| self.deployment(cluster, n)).collect::<Result<Vec<_>>>()?;
        Ok(items.into())
    }

    /// Creates and deletes apply directly; updates go through the rolling gate.
    fn update_change(
        &self,
        pass: &PassContext,
        current: &ResourceState<Deployment>,
        desired: &ResourceState<Deployment>,
    ) -> Result<ChangeSet<Deployment>> {
        let mut change = diff_by_key(&current.items, &desired.items, object_key::<Deployment>, |_, _| Ok(false))?;
        change.to_update = gate_updates(pass.updates_allowed, &current.items, &desired.items)?;
        Ok(change)
    }
}
