//! Corral store: the backing store contract, an in-RAM implementation and watch-event coalescing.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use corral_core::StoreError;
use kube::core::{ApiResource, DynamicObject};

mod coalesce;
mod mem;
pub mod typed;

pub use coalesce::Coalescer;
pub use mem::MemStore;

/// Declarative object store reachable by kind + namespace + name.
///
/// Objects travel as `DynamicObject` so the trait stays object safe; see [`typed`]
/// for the `k8s-openapi` facing helpers.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fails with `StoreError::NotFound` when the object is absent.
    async fn get(&self, kind: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError>;

    /// `namespace = None` lists across namespaces. `selector` is a label selector (`k=v,k2=v2`).
    async fn list(&self, kind: &ApiResource, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace the object. A set `metadata.resourceVersion` makes the write conditional.
    async fn update(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace only the status sub-resource.
    async fn update_status(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, kind: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;
}

/// Parse an equality-only label selector (`a=b,c=d`). Empty clauses are ignored.
pub fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|clause| {
            let clause = clause.trim();
            if clause.is_empty() { return None; }
            let (k, v) = clause.split_once('=').unwrap_or((clause, ""));
            Some((k.trim().to_string(), v.trim_start_matches('=').trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing() {
        let s = parse_selector("app=web, tier==front,,");
        assert_eq!(s, vec![("app".to_string(), "web".to_string()), ("tier".to_string(), "front".to_string())]);
        assert!(parse_selector("").is_empty());
    }
}
