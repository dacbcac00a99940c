//! Typed facade over [`BackingStore`] for `k8s-openapi` and custom resource types.

use corral_core::{Error, StoreError};
use kube::core::{ApiResource, DynamicObject, Resource};
use serde::{de::DeserializeOwned, Serialize};

use crate::BackingStore;

/// Bound shared by every kind the controller reads or writes.
pub trait Kind: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<K> Kind for K where K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

pub fn api_resource<K: Kind>() -> ApiResource { ApiResource::erase::<K>(&()) }

pub fn to_dynamic<K: Kind>(obj: &K) -> Result<DynamicObject, Error> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        let ar = api_resource::<K>();
        dynamic.types = Some(kube::core::TypeMeta { api_version: ar.api_version, kind: ar.kind });
    }
    Ok(dynamic)
}

pub fn from_dynamic<K: Kind>(obj: DynamicObject) -> Result<K, Error> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get<K: Kind>(store: &dyn BackingStore, namespace: Option<&str>, name: &str) -> Result<K, Error> {
    let obj = store.get(&api_resource::<K>(), namespace, name).await?;
    from_dynamic(obj)
}

/// Like [`get`] with NotFound mapped to `None`.
pub async fn get_opt<K: Kind>(store: &dyn BackingStore, namespace: Option<&str>, name: &str) -> Result<Option<K>, Error> {
    match store.get(&api_resource::<K>(), namespace, name).await {
        Ok(obj) => Ok(Some(from_dynamic(obj)?)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn list<K: Kind>(store: &dyn BackingStore, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>, Error> {
    store
        .list(&api_resource::<K>(), namespace, selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

pub async fn create<K: Kind>(store: &dyn BackingStore, obj: &K) -> Result<K, Error> {
    let created = store.create(&api_resource::<K>(), &to_dynamic(obj)?).await?;
    from_dynamic(created)
}

pub async fn update<K: Kind>(store: &dyn BackingStore, obj: &K) -> Result<K, Error> {
    let updated = store.update(&api_resource::<K>(), &to_dynamic(obj)?).await?;
    from_dynamic(updated)
}

pub async fn update_status<K: Kind>(store: &dyn BackingStore, obj: &K) -> Result<K, Error> {
    let updated = store.update_status(&api_resource::<K>(), &to_dynamic(obj)?).await?;
    from_dynamic(updated)
}

pub async fn delete<K: Kind>(store: &dyn BackingStore, namespace: Option<&str>, name: &str) -> Result<(), Error> {
    store.delete(&api_resource::<K>(), namespace, name).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn dynamic_round_trip_keeps_type_meta() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("x".into()), namespace: Some("ns".into()), ..Default::default() },
            data: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        };
        let d = to_dynamic(&cm).unwrap();
        let types = d.types.clone().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(d.data["data"]["k"], "v");
        let back: ConfigMap = from_dynamic(d).unwrap();
        assert_eq!(back, cm);
    }
}
