//! Resource handler contract.
//!
//! [`Handler`] is the object-safe unit the engine invokes. Most handlers manage one
//! store kind and are written against [`CrudResource`] instead; [`Crud`] turns
//! one into the other by running current state → desired state → diff → apply.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{ChangeSet, Error, PassContext, PassOutcome, ResourceState, Result, StoreError};
use corral_store::{typed, typed::Kind, BackingStore};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::diff::{diff_objects, object_key};

#[async_trait]
pub trait Handler<O: Send + Sync>: Send + Sync {
    fn name(&self) -> &str;

    async fn ensure_created(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome>;

    async fn ensure_deleted(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome>;
}

#[async_trait]
impl<O, H> Handler<O> for Arc<H>
where
    O: Send + Sync,
    H: Handler<O> + ?Sized,
{
    fn name(&self) -> &str { (**self).name() }

    async fn ensure_created(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        (**self).ensure_created(pass, obj).await
    }

    async fn ensure_deleted(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        (**self).ensure_deleted(pass, obj).await
    }
}

/// Reconciliation of one store kind owned by the declared object.
#[async_trait]
pub trait CrudResource<O: Send + Sync>: Send + Sync {
    type Item: Kind + Debug;

    fn name(&self) -> &str;

    fn store(&self) -> &dyn BackingStore;

    /// All `Item` objects belonging to `obj`. Absent objects are omitted, not errors.
    async fn current_state(&self, pass: &PassContext, obj: &O) -> Result<ResourceState<Self::Item>>;

    /// Pure function of `obj` and the handler's injected configuration.
    fn desired_state(&self, pass: &PassContext, obj: &O) -> Result<ResourceState<Self::Item>>;

    fn update_change(
        &self,
        _pass: &PassContext,
        current: &ResourceState<Self::Item>,
        desired: &ResourceState<Self::Item>,
    ) -> Result<ChangeSet<Self::Item>> {
        diff_objects(&current.items, &desired.items)
    }

    /// Everything the declared object owns goes on delete.
    fn delete_change(&self, _pass: &PassContext, current: &ResourceState<Self::Item>) -> ChangeSet<Self::Item> {
        ChangeSet { to_delete: current.items.clone(), ..Default::default() }
    }

    async fn apply(&self, _pass: &PassContext, change: &ChangeSet<Self::Item>) -> Result<()> {
        apply_objects(self.store(), self.name(), change).await
    }
}

/// Issue a change set against the store.
///
/// Creates tolerate AlreadyExists and deletes tolerate NotFound; update
/// conflicts surface to the caller.
pub async fn apply_objects<K: Kind>(store: &dyn BackingStore, handler: &str, change: &ChangeSet<K>) -> Result<()> {
    for obj in &change.to_create {
        match typed::create(store, obj).await {
            Ok(_) => info!(handler, object = %object_key(obj), "created"),
            Err(Error::Store(StoreError::AlreadyExists(_))) => debug!(handler, object = %object_key(obj), "already exists"),
            Err(e) => return Err(e),
        }
    }
    for obj in &change.to_update {
        typed::update(store, obj).await?;
        info!(handler, object = %object_key(obj), "updated");
    }
    for obj in &change.to_delete {
        match typed::delete::<K>(store, obj.namespace().as_deref(), &obj.name_any()).await {
            Ok(()) => info!(handler, object = %object_key(obj), "deleted"),
            Err(Error::Store(StoreError::NotFound(_))) => debug!(handler, object = %object_key(obj), "already gone"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Adapts a [`CrudResource`] into a [`Handler`].
pub struct Crud<R> {
    resource: R,
}

impl<R> Crud<R> {
    pub fn new(resource: R) -> Self { Self { resource } }

    pub fn inner(&self) -> &R { &self.resource }
}

#[async_trait]
impl<O, R> Handler<O> for Crud<R>
where
    O: Send + Sync,
    R: CrudResource<O>,
{
    fn name(&self) -> &str { self.resource.name() }

    async fn ensure_created(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        let current = self.resource.current_state(pass, obj).await?;
        let desired = self.resource.desired_state(pass, obj)?;
        let change = self.resource.update_change(pass, &current, &desired)?;
        if change.is_empty() {
            debug!(handler = self.resource.name(), current = current.len(), "in sync");
            return Ok(PassOutcome::proceed());
        }
        debug!(
            handler = self.resource.name(),
            create = change.to_create.len(),
            update = change.to_update.len(),
            delete = change.to_delete.len(),
            "applying change set"
        );
        self.resource.apply(pass, &change).await?;
        Ok(PassOutcome::proceed())
    }

    async fn ensure_deleted(&self, pass: &PassContext, obj: &O) -> Result<PassOutcome> {
        let current = self.resource.current_state(pass, obj).await?;
        let change = self.resource.delete_change(pass, &current);
        if !change.is_empty() {
            debug!(handler = self.resource.name(), delete = change.to_delete.len(), "applying delete change set");
            self.resource.apply(pass, &change).await?;
        }
        Ok(PassOutcome::proceed())
    }
}
