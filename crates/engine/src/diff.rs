//! Change-set differ and desired-vs-live drift detection.

use std::collections::HashSet;

use corral_core::{ChangeSet, Result};
use corral_store::typed::Kind;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// `removes` counts every base-only entry; `extras` is the subset of those the
/// target owns outright (foreign keys in data maps and labels, trailing list items).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
    #[serde(default)]
    pub extras: usize,
}

impl DiffSummary {
    /// Server-defaulted fields on the base are not drift; anything else that differs is.
    pub fn is_drift(&self) -> bool { self.adds + self.updates + self.extras > 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// The server may fill in keys the target never set.
    Defaulted,
    /// Every key belongs to the target (`data` and friends).
    Owned,
    /// Labels and annotations: owned except for `kubernetes.io` system keys.
    Keyed,
}

fn child_scope(depth: usize, at: Option<&str>, key: &str) -> Scope {
    match (depth, at, key) {
        (0, _, "data" | "binaryData" | "stringData") => Scope::Owned,
        (_, Some("metadata"), "labels" | "annotations") => Scope::Keyed,
        _ => Scope::Defaulted,
    }
}

fn system_key(key: &str) -> bool {
    match key.split_once('/') {
        Some((prefix, _)) => prefix == "kubernetes.io" || prefix.ends_with(".kubernetes.io"),
        None => false,
    }
}

/// Drop server-populated metadata and status before comparing.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink", "deletionTimestamp", "deletionGracePeriodSeconds"] {
                obj.remove(k);
            }
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Count how `target` departs from `base`, recursing through maps and lists.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, depth: usize, at: Option<&str>, scope: Scope, s: &mut DiffSummary) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, depth + 1, Some(k), child_scope(depth, at, k), s);
                    } else {
                        s.adds += 1;
                    }
                }
                for k in bo.keys().filter(|k| !ao.contains_key(*k)) {
                    s.removes += 1;
                    if scope == Scope::Owned || (scope == Scope::Keyed && !system_key(k)) { s.extras += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                // pairwise so defaulted fields inside list items don't count as changes
                for (av, bv) in aa.iter().zip(bb.iter()) {
                    if av != bv { walk(av, bv, depth + 1, None, Scope::Defaulted, s); }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() {
                    s.removes += bb.len() - aa.len();
                    s.extras += bb.len() - aa.len();
                }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, 0, None, Scope::Defaulted, &mut s);
    s
}

/// Compare a desired value against what the store returned.
pub fn drift<T: Serialize>(desired: &T, live: &T) -> Result<DiffSummary> {
    let d = strip_noisy(serde_json::to_value(desired)?);
    let l = strip_noisy(serde_json::to_value(live)?);
    Ok(diff_summary(&d, &l))
}

/// `namespace/name` identity key of a stored object.
pub fn object_key<K: Kind>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Generic identity-keyed diff. `modified(current, desired)` decides updates;
/// the desired item is what lands in `to_update`.
pub fn diff_by_key<T, K, M>(current: &[T], desired: &[T], key: K, mut modified: M) -> Result<ChangeSet<T>>
where
    T: Clone,
    K: Fn(&T) -> String,
    M: FnMut(&T, &T) -> Result<bool>,
{
    let current_keys: HashSet<String> = current.iter().map(&key).collect();
    let desired_keys: HashSet<String> = desired.iter().map(&key).collect();
    let mut change = ChangeSet::default();
    for d in desired {
        if !current_keys.contains(&key(d)) { change.to_create.push(d.clone()); }
    }
    for c in current {
        if !desired_keys.contains(&key(c)) { change.to_delete.push(c.clone()); }
    }
    for c in current {
        let k = key(c);
        if let Some(d) = desired.iter().find(|d| key(d) == k) {
            if modified(c, d)? { change.to_update.push(d.clone()); }
        }
    }
    Ok(change)
}

/// Copy the live resourceVersion onto a desired object so the update is conditional.
pub fn carry_version<K: Kind>(live: &K, desired: &K) -> K {
    let mut next = desired.clone();
    next.meta_mut().resource_version = live.meta().resource_version.clone();
    next
}

/// Default differ for store objects: direct, ungated updates on any drift.
pub fn diff_objects<K: Kind>(current: &[K], desired: &[K]) -> Result<ChangeSet<K>> {
    let mut change = diff_by_key(current, desired, object_key::<K>, |c, d| Ok(drift(d, c)?.is_drift()))?;
    change.to_update = change
        .to_update
        .iter()
        .map(|d| {
            let k = object_key(d);
            current.iter().find(|c| object_key(*c) == k).map(|c| carry_version(c, d)).unwrap_or_else(|| d.clone())
        })
        .collect();
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn strip_noisy_prunes_common_fields() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "u",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("uid"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn lists_compare_item_by_item() {
        let live = serde_json::json!({
            "ports": [ { "name": "http", "port": 80, "targetPort": 80 }, { "name": "https", "port": 443, "targetPort": 443 } ]
        });
        let same = serde_json::json!({ "ports": [ { "name": "http", "port": 80 }, { "name": "https", "port": 443 } ] });
        assert_eq!(diff_summary(&same, &live), DiffSummary { removes: 2, ..Default::default() });

        let renumbered = serde_json::json!({ "ports": [ { "name": "http", "port": 8080 }, { "name": "https", "port": 443 }, { "name": "metrics", "port": 9100 } ] });
        let s = diff_summary(&renumbered, &live);
        assert_eq!((s.adds, s.updates, s.extras), (1, 1, 0));

        let trimmed = serde_json::json!({ "ports": [ { "name": "http", "port": 80 } ] });
        let s = diff_summary(&trimmed, &live);
        assert_eq!(s.extras, 1);
        assert!(s.is_drift());
    }

    #[test]
    fn foreign_keys_in_owned_maps_are_drift() {
        let desired = serde_json::json!({ "metadata": { "name": "x", "labels": { "app": "vm" } }, "data": { "k": "v" } });
        let injected = serde_json::json!({ "metadata": { "name": "x", "labels": { "app": "vm" } }, "data": { "k": "v", "injected": "x" } });
        assert!(diff_summary(&desired, &injected).is_drift());

        let relabelled = serde_json::json!({ "metadata": { "name": "x", "labels": { "app": "vm", "team": "other" } }, "data": { "k": "v" } });
        assert!(diff_summary(&desired, &relabelled).is_drift());

        let system = serde_json::json!({
            "metadata": {
                "name": "x",
                "labels": { "app": "vm", "kubernetes.io/metadata.name": "x" },
                "annotations": { "deployment.kubernetes.io/revision": "3" }
            },
            "data": { "k": "v" }
        });
        let s = diff_summary(&desired, &system);
        assert_eq!((s.removes, s.extras), (2, 0));
        assert!(!s.is_drift());
    }

    #[test]
    fn server_defaults_inside_lists_are_not_drift() {
        let desired = serde_json::json!({ "containers": [ { "name": "vm", "image": "i:1" } ] });
        let live = serde_json::json!({ "containers": [ { "name": "vm", "image": "i:1", "imagePullPolicy": "IfNotPresent" } ] });
        assert!(!diff_summary(&desired, &live).is_drift());
        let bumped = serde_json::json!({ "containers": [ { "name": "vm", "image": "i:2" } ] });
        assert!(diff_summary(&bumped, &live).is_drift());
    }

    fn cm(name: &str, v: &str, rv: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), resource_version: rv.map(|s| s.into()), ..Default::default() },
            data: Some([("k".to_string(), v.to_string())].into()),
            ..Default::default()
        }
    }

    #[test]
    fn diff_objects_splits_create_update_delete() {
        let current = vec![cm("keep", "1", Some("7")), cm("drift", "1", Some("8")), cm("gone", "1", Some("9"))];
        let desired = vec![cm("keep", "1", None), cm("drift", "2", None), cm("new", "1", None)];
        let change = diff_objects(&current, &desired).unwrap();
        let names = |v: &Vec<ConfigMap>| v.iter().map(|c| c.name_any()).collect::<Vec<_>>();
        assert_eq!(names(&change.to_create), vec!["new"]);
        assert_eq!(names(&change.to_delete), vec!["gone"]);
        assert_eq!(names(&change.to_update), vec!["drift"]);
        assert_eq!(change.to_update[0].metadata.resource_version.as_deref(), Some("8"));
        assert_eq!(change.to_update[0].data.as_ref().unwrap()["k"], "2");
    }

    #[test]
    fn injected_data_key_is_reverted() {
        let mut live = cm("settings", "v", Some("4"));
        live.data.as_mut().unwrap().insert("injected".into(), "x".into());
        let change = diff_objects(&[live], &[cm("settings", "v", None)]).unwrap();
        assert_eq!(change.to_update.len(), 1);
        assert!(!change.to_update[0].data.as_ref().unwrap().contains_key("injected"));
        assert_eq!(change.to_update[0].metadata.resource_version.as_deref(), Some("4"));
    }
}
