//! Well-known labels, annotations and finalizers.

/// Label carrying the owning cluster id on every managed object.
pub const CLUSTER_LABEL: &str = "corral.dev/cluster";
/// Label carrying the node id on per-node objects.
pub const NODE_LABEL: &str = "corral.dev/node";
pub const ROLE_LABEL: &str = "corral.dev/role";
/// Schema version of the generation that produced a compute unit; routes pod passes.
pub const VERSION_LABEL: &str = "corral.dev/version";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "corral";

/// Authoritative convergence signal on replica groups.
pub const VERSION_ANNOTATION: &str = "corral.dev/version";
pub const NODE_INDEX_ANNOTATION: &str = "corral.dev/node-index";

/// Address a compute unit reports for itself.
pub const ENDPOINT_IP_ANNOTATION: &str = "endpoint.corral.dev/ip";
/// Service whose address list the compute unit contributes to.
pub const ENDPOINT_SERVICE_ANNOTATION: &str = "endpoint.corral.dev/service";
/// Set to "true" once the unit's workloads have been drained.
pub const DRAINED_ANNOTATION: &str = "corral.dev/drained";

pub const CLUSTER_FINALIZER: &str = "corral.dev/cluster-controller";
pub const ENDPOINT_FINALIZER: &str = "corral.dev/endpoint-controller";

/// `app.kubernetes.io/managed-by=corral,corral.dev/cluster=<id>`
pub fn cluster_selector(cluster_id: &str) -> String {
    format!("{}={},{}={}", MANAGED_BY_LABEL, MANAGED_BY, CLUSTER_LABEL, cluster_id)
}
