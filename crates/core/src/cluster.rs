//! The declared cluster: the desired-state object operators submit.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    schema = "disabled",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.schemaVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Immutable identity; owned objects live in a namespace of this name.
    pub cluster_id: String,
    /// Semver string selecting the controller generation.
    pub schema_version: String,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: String,
    pub role: NodeRole,
    pub cpus: u32,
    /// Memory quantity, e.g. `4Gi`.
    pub memory: String,
}

impl NodeSpec {
    pub fn new(id: &str, role: NodeRole, cpus: u32, memory: &str) -> Self {
        Self { id: id.to_string(), role, cpus, memory: memory.to_string() }
    }

    /// Object name shared by the node's deployment and config map.
    pub fn object_name(&self) -> String { format!("{}-{}", self.role.as_str(), self.id) }

    pub fn memory_bytes(&self) -> Result<u64> { crate::quantity::parse_bytes(&self.memory) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// NodeID -> stable positive index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_indexes: BTreeMap<String, u32>,
    /// Last configuration/validation error seen by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Cluster {
    pub fn cluster_id(&self) -> &str { &self.spec.cluster_id }

    pub fn node_indexes(&self) -> BTreeMap<String, u32> {
        self.status.as_ref().map(|s| s.node_indexes.clone()).unwrap_or_default()
    }

    pub fn node_index(&self, node_id: &str) -> Result<u32> {
        self.status
            .as_ref()
            .and_then(|s| s.node_indexes.get(node_id).copied())
            .ok_or_else(|| Error::validation(format!("node {} has no index assigned", node_id)))
    }

    pub fn parsed_version(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.spec.schema_version)
            .map_err(|e| Error::validation(format!("bad schema version {:?}: {}", self.spec.schema_version, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Cluster {
        let mut c = Cluster::new("demo", ClusterSpec {
            cluster_id: "c1".into(),
            schema_version: "2.1.0".into(),
            nodes: vec![NodeSpec::new("a", NodeRole::Master, 2, "4Gi")],
        });
        c.metadata.namespace = Some("default".into());
        c
    }

    #[test]
    fn serializes_camel_case_and_round_trips() {
        let mut c = sample();
        c.status = Some(ClusterStatus { node_indexes: [("a".to_string(), 1)].into(), last_error: None });
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["apiVersion"], "corral.dev/v1alpha1");
        assert_eq!(v["kind"], "Cluster");
        assert_eq!(v["spec"]["clusterId"], "c1");
        assert_eq!(v["spec"]["nodes"][0]["role"], "Master");
        assert_eq!(v["status"]["nodeIndexes"]["a"], 1);
        assert!(v["status"].get("lastError").is_none());
        let back: Cluster = serde_json::from_value(v).unwrap();
        assert_eq!(back.spec, c.spec);
        assert_eq!(back.status, c.status);
    }

    #[test]
    fn node_index_lookup_and_version() {
        let c = sample();
        assert!(matches!(c.node_index("a"), Err(Error::Validation(_))));
        assert_eq!(c.parsed_version().unwrap(), semver::Version::new(2, 1, 0));
        let mut bad = sample();
        bad.spec.schema_version = "two".into();
        assert!(bad.parsed_version().unwrap_err().is_fatal());
        assert_eq!(c.spec.nodes[0].object_name(), "master-a");
    }
}
