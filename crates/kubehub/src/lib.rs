//! Corral kubehub: API-server backed store and watcher wiring.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{Context, Result};
use async_trait::async_trait;
use corral_core::{ObjectKey, StoreError};
use corral_store::{typed::Kind, BackingStore};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, TypeMeta},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Map a kube client error onto the store taxonomy.
pub fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
            (404, _) => StoreError::NotFound(resp.message),
            (409, "AlreadyExists") => StoreError::AlreadyExists(resp.message),
            (409, _) => StoreError::Conflict(resp.message),
            (429, _) | (500..=599, _) => StoreError::Transient(format!("{} {}", resp.code, resp.message)),
            _ => StoreError::Rejected(format!("{} {}: {}", resp.code, resp.reason, resp.message)),
        },
        kube::Error::SerdeError(e) => StoreError::Rejected(format!("decoding response: {}", e)),
        other => StoreError::Transient(other.to_string()),
    }
}

/// [`BackingStore`] talking to the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, kind: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, kind),
            None => Api::all_with(self.client.clone(), kind),
        }
    }

    fn named(obj: &DynamicObject) -> Result<&str, StoreError> {
        obj.metadata.name.as_deref().ok_or_else(|| StoreError::Rejected("object missing metadata.name".into()))
    }
}

fn with_types(mut obj: DynamicObject, kind: &ApiResource) -> DynamicObject {
    // list items come back without apiVersion/kind
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: kind.api_version.clone(), kind: kind.kind.clone() });
    }
    obj
}

#[async_trait]
impl BackingStore for KubeStore {
    async fn get(&self, kind: &ApiResource, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let obj = self.api(kind, namespace).get(name).await.map_err(classify)?;
        Ok(with_types(obj, kind))
    }

    async fn list(&self, kind: &ApiResource, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut lp = ListParams::default();
        if let Some(sel) = selector { lp = lp.labels(sel); }
        let list = self.api(kind, namespace).list(&lp).await.map_err(classify)?;
        Ok(list.items.into_iter().map(|o| with_types(o, kind)).collect())
    }

    async fn create(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let created = self
            .api(kind, obj.metadata.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(classify)?;
        Ok(with_types(created, kind))
    }

    async fn update(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = Self::named(obj)?;
        let updated = self
            .api(kind, obj.metadata.namespace.as_deref())
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(classify)?;
        Ok(with_types(updated, kind))
    }

    async fn update_status(&self, kind: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = Self::named(obj)?;
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Rejected(format!("encoding status: {}", e)))?;
        let updated = self
            .api(kind, obj.metadata.namespace.as_deref())
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(classify)?;
        Ok(with_types(updated, kind))
    }

    async fn delete(&self, kind: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.api(kind, namespace).delete(name, &DeleteParams::default()).await.map_err(classify)?;
        Ok(())
    }
}

fn key_of<K: Kind>(obj: &K) -> ObjectKey {
    ObjectKey { namespace: obj.namespace(), name: obj.name_any() }
}

/// Start list+watch for kind `K` and forward the key of every touched object.
///
/// Deleted events are forwarded too: the pass will find the object gone and do nothing.
pub async fn start_watcher<K>(client: Client, namespace: Option<&str>, selector: Option<&str>, key_tx: mpsc::Sender<ObjectKey>) -> Result<()>
where
    K: Kind + kube::Resource<Scope = k8s_openapi::NamespaceResourceScope> + Debug,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let mut cfg = watcher::Config::default();
    if let Some(sel) = selector { cfg = cfg.labels(sel); }
    let kind = K::kind(&()).to_string();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, selector = ?selector, "watcher started");
    while let Some(ev) = stream.try_next().await.with_context(|| format!("watching {}", kind))? {
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(o) | Event::Deleted(o) => vec![key_of(&o)],
            Event::Restarted(list) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                list.iter().map(key_of).collect()
            }
        };
        metrics::counter!("corral_watch_events_total", keys.len() as u64, "kind" => kind.clone());
        for key in keys {
            if key_tx.send(key).await.is_err() {
                warn!(kind = %kind, "key channel closed; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}
