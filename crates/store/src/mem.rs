use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use corral_core::{Error, StoreError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject};
use tracing::debug;

use crate::typed::{self, Kind};
use crate::{parse_selector, BackingStore};

type Key = (String, Option<String>, String);

#[derive(Default)]
struct Inner {
    // BTreeMap keeps list order stable (kind, namespace, name)
    objects: BTreeMap<Key, DynamicObject>,
    next_rv: u64,
    writes: u64,
    log: Vec<String>,
    read_faults: VecDeque<StoreError>,
    write_faults: VecDeque<StoreError>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn record(&mut self, op: &str, key: &Key) {
        self.writes += 1;
        let ns = key.1.as_deref().map(|n| format!("{}/", n)).unwrap_or_default();
        self.log.push(format!("{} {} {}{}", op, key.0, ns, key.2));
    }
}

/// In-RAM backing store with Kubernetes-like semantics: resource versions and
/// optimistic concurrency, a status sub-resource, and finalizer-gated deletion.
///
/// Successful writes are counted; faults can be queued to exercise retry paths.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn kind_key(kind: &ApiResource) -> String { format!("{}/{}", kind.api_version, kind.kind) }

fn key_of(kind: &ApiResource, obj: &DynamicObject) -> Result<Key, StoreError> {
    let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Rejected("object missing metadata.name".into()))?;
    Ok((kind_key(kind), obj.metadata.namespace.clone(), name))
}

fn describe(key: &Key) -> String {
    match &key.1 {
        Some(ns) => format!("{} {}/{}", key.0, ns, key.2),
        None => format!("{} {}", key.0, key.2),
    }
}

fn check_version(incoming: &DynamicObject, stored: &DynamicObject, key: &Key) -> Result<(), StoreError> {
    match &incoming.metadata.resource_version {
        Some(rv) if stored.metadata.resource_version.as_ref() != Some(rv) => Err(StoreError::Conflict(format!(
            "{}: resourceVersion {} is stale (stored {})",
            describe(key),
            rv,
            stored.metadata.resource_version.as_deref().unwrap_or("-")
        ))),
        _ => Ok(()),
    }
}

fn set_status(obj: &mut DynamicObject, status: Option<serde_json::Value>) {
    if !obj.data.is_object() { obj.data = serde_json::json!({}); }
    if let Some(map) = obj.data.as_object_mut() {
        match status {
            Some(s) => { map.insert("status".into(), s); }
            None => { map.remove("status"); }
        }
    }
}

fn has_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert an object as if it already existed; not counted as a write.
    pub fn seed<K: Kind>(&self, obj: &K) -> Result<K, Error> {
        let mut dynamic = typed::to_dynamic(obj)?;
        let ar = typed::api_resource::<K>();
        let key = key_of(&ar, &dynamic)?;
        let mut inner = self.lock();
        dynamic.metadata.resource_version = Some(inner.bump());
        if dynamic.metadata.uid.is_none() {
            dynamic.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        inner.objects.insert(key, dynamic.clone());
        typed::from_dynamic(dynamic)
    }

    /// Number of successful mutations since creation or the last reset.
    pub fn writes(&self) -> u64 { self.lock().writes }

    /// Human-readable log of successful mutations (`op kind ns/name`).
    pub fn write_log(&self) -> Vec<String> { self.lock().log.clone() }

    pub fn reset_counters(&self) {
        let mut inner = self.lock();
        inner.writes = 0;
        inner.log.clear();
    }

    /// Fail the next read calls (get/list) with the given errors, in order.
    pub fn fail_reads(&self, errs: impl IntoIterator<Item = StoreError>) { self.lock().read_faults.extend(errs); }

    /// Fail the next write calls (create/update/update_status/delete) with the given errors, in order.
    pub fn fail_writes(&self, errs: impl IntoIterator<Item = StoreError>) { self.lock().write_faults.extend(errs); }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }
}

#[async_trait]
impl BackingStore for MemStore {
    async fn get(&self, kind: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        if let Some(e) = inner.read_faults.pop_front() { return Err(e); }
        let key = (kind_key(kind), namespace.map(|s| s.to_string()), name.to_string());
        inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(describe(&key)))
    }

    async fn list(&self, kind: &ApiResource, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        if let Some(e) = inner.read_faults.pop_front() { return Err(e); }
        let kk = kind_key(kind);
        let wanted = selector.map(parse_selector).unwrap_or_default();
        let out = inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kk && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, obj)| {
                let labels = obj.metadata.labels.as_ref();
                wanted.iter().all(|(k, v)| labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false))
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(out)
    }

    async fn create(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(kind, obj)?;
        let mut inner = self.lock();
        if let Some(e) = inner.write_faults.pop_front() { return Err(e); }
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe(&key)));
        }
        let mut next = obj.clone();
        next.metadata.resource_version = Some(inner.bump());
        next.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        next.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        next.metadata.deletion_timestamp = None;
        if next.types.is_none() {
            next.types = Some(kube::core::TypeMeta { api_version: kind.api_version.clone(), kind: kind.kind.clone() });
        }
        inner.record("create", &key);
        inner.objects.insert(key, next.clone());
        Ok(next)
    }

    async fn update(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(kind, obj)?;
        let mut inner = self.lock();
        if let Some(e) = inner.write_faults.pop_front() { return Err(e); }
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(describe(&key)))?;
        check_version(obj, &stored, &key)?;
        let mut next = obj.clone();
        next.types = stored.types.clone();
        next.metadata.uid = stored.metadata.uid.clone();
        next.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        // status only changes through update_status
        set_status(&mut next, stored.data.get("status").cloned());
        next.metadata.resource_version = Some(inner.bump());
        inner.record("update", &key);
        if next.metadata.deletion_timestamp.is_some() && !has_finalizers(&next) {
            debug!(object = %describe(&key), "last finalizer removed; object gone");
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, next.clone());
        }
        Ok(next)
    }

    async fn update_status(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(kind, obj)?;
        let mut inner = self.lock();
        if let Some(e) = inner.write_faults.pop_front() { return Err(e); }
        let mut next = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(describe(&key)))?;
        check_version(obj, &next, &key)?;
        set_status(&mut next, obj.data.get("status").cloned());
        next.metadata.resource_version = Some(inner.bump());
        inner.record("update_status", &key);
        inner.objects.insert(key, next.clone());
        Ok(next)
    }

    async fn delete(&self, kind: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let key = (kind_key(kind), namespace.map(|s| s.to_string()), name.to_string());
        let mut inner = self.lock();
        if let Some(e) = inner.write_faults.pop_front() { return Err(e); }
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(describe(&key)))?;
        if has_finalizers(&stored) {
            if stored.metadata.deletion_timestamp.is_none() {
                let mut next = stored;
                next.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                next.metadata.resource_version = Some(inner.bump());
                inner.objects.insert(key.clone(), next);
            }
        } else {
            inner.objects.remove(&key);
        }
        inner.record("delete", &key);
        Ok(())
    }
}
