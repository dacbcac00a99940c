use corral_core::{keys, Cluster};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::router::Declared;

impl Declared for Cluster {
    fn schema_version(&self) -> Option<String> { Some(self.spec.schema_version.clone()) }

    fn record_failure(&mut self, message: Option<String>) -> bool {
        let status = self.status.get_or_insert_with(Default::default);
        if status.last_error == message { return false; }
        status.last_error = message;
        true
    }
}

/// Compute units route by the generation that created them.
impl Declared for Pod {
    fn schema_version(&self) -> Option<String> { self.labels().get(keys::VERSION_LABEL).cloned() }
}
