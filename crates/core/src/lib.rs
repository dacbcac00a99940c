//! Corral core types: the declared cluster model, per-pass snapshots and signals.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod config;
pub mod error;
pub mod keys;
pub mod quantity;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus, NodeRole, NodeSpec};
pub use config::{ControllerConfig, RetrySettings};
pub use error::{Error, Result, StoreError};

/// Namespaced (or cluster-scoped) object identity used for queueing and diffing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn cluster_scoped(name: &str) -> Self { Self::new(None, name) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Handler-specific snapshot of one object kind, valid for a single pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub items: Vec<T>,
}

impl<T> ResourceState<T> {
    pub fn new(items: Vec<T>) -> Self { Self { items } }
    pub fn empty() -> Self { Self { items: Vec::new() } }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn iter(&self) -> std::slice::Iter<'_, T> { self.items.iter() }
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self { Self::empty() }
}

impl<T> From<Vec<T>> for ResourceState<T> {
    fn from(items: Vec<T>) -> Self { Self { items } }
}

/// Create/update/delete delta between current and desired state of one handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet<T> {
    pub to_create: Vec<T>,
    pub to_update: Vec<T>,
    pub to_delete: Vec<T>,
}

impl<T> Default for ChangeSet<T> {
    fn default() -> Self { Self { to_create: Vec::new(), to_update: Vec::new(), to_delete: Vec::new() } }
}

impl<T> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize { self.to_create.len() + self.to_update.len() + self.to_delete.len() }
}

/// Signals a handler hands back to the engine after running.
///
/// `cancel_remainder` stops the pass after the current handler. `keep_finalizer`
/// only matters on delete passes: the finalizer stays even though the pass ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub cancel_remainder: bool,
    pub keep_finalizer: bool,
}

impl PassOutcome {
    pub const fn proceed() -> Self { Self { cancel_remainder: false, keep_finalizer: false } }
    pub const fn cancel() -> Self { Self { cancel_remainder: true, keep_finalizer: false } }
    pub const fn cancel_and_keep_finalizer() -> Self { Self { cancel_remainder: true, keep_finalizer: true } }

    /// Fold a later handler's outcome into the pass outcome; signals are sticky.
    pub fn merge(self, other: PassOutcome) -> Self {
        Self {
            cancel_remainder: self.cancel_remainder || other.cancel_remainder,
            keep_finalizer: self.keep_finalizer || other.keep_finalizer,
        }
    }
}

/// Per-pass inputs supplied by the embedding process at pass start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassContext {
    /// Whether disruptive updates may be issued in this pass.
    pub updates_allowed: bool,
    /// The declared object carries a deletion timestamp.
    pub deleting: bool,
}

impl PassContext {
    pub fn create(updates_allowed: bool) -> Self { Self { updates_allowed, deleting: false } }
    pub fn delete() -> Self { Self { updates_allowed: false, deleting: true } }
}

pub mod prelude {
    pub use super::{ChangeSet, Error, ObjectKey, PassContext, PassOutcome, ResourceState, StoreError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_signals_are_sticky() {
        let o = PassOutcome::proceed().merge(PassOutcome::cancel_and_keep_finalizer()).merge(PassOutcome::proceed());
        assert!(o.cancel_remainder);
        assert!(o.keep_finalizer);
        assert_eq!(PassOutcome::default(), PassOutcome::proceed());
    }

    #[test]
    fn change_set_defaults_empty() {
        let cs: ChangeSet<u8> = ChangeSet::default();
        assert!(cs.is_empty());
        let cs = ChangeSet { to_create: vec![1], to_update: vec![], to_delete: vec![2, 3] };
        assert_eq!(cs.len(), 3);
    }

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::new(Some("ns"), "a").to_string(), "ns/a");
        assert_eq!(ObjectKey::cluster_scoped("c1").to_string(), "c1");
    }
}
