//! Resource sets and the generation router.
//!
//! Each set is the ordered handler list of one controller generation plus a
//! predicate over the declared schema version. The router picks the first
//! matching set, in registration order.

use std::fmt::Debug;
use std::sync::Arc;

use corral_core::{Error, PassContext, PassOutcome, Result};
use corral_store::typed::Kind;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::handler::Handler;

/// A desired-state object the engine can reconcile.
pub trait Declared: Kind + Debug {
    /// Raw schema version string selecting the resource set; `None` when undeclared.
    fn schema_version(&self) -> Option<String>;

    /// Store (or clear) the last configuration error on the object's status.
    /// Returns whether anything changed. Kinds without such a field keep the default.
    fn record_failure(&mut self, _message: Option<String>) -> bool { false }

    fn is_deleting(&self) -> bool { self.meta().deletion_timestamp.is_some() }
}

type Predicate = Box<dyn Fn(&Version) -> bool + Send + Sync>;

pub struct ResourceSet<O: Send + Sync> {
    name: String,
    selector: String,
    predicate: Predicate,
    handlers: Vec<Arc<dyn Handler<O>>>,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub resource_set: String,
    pub invoked: Vec<String>,
    pub cancelled_by: Option<String>,
    pub outcome: PassOutcome,
}

impl<O: Declared> ResourceSet<O> {
    pub fn new<P>(name: &str, selector: &str, predicate: P) -> Self
    where
        P: Fn(&Version) -> bool + Send + Sync + 'static,
    {
        Self { name: name.to_string(), selector: selector.to_string(), predicate: Box::new(predicate), handlers: Vec::new() }
    }

    /// Set matching a semver requirement such as `>=2.0.0, <3.0.0`.
    pub fn for_versions(name: &str, requirement: &str) -> Result<Self> {
        let req = VersionReq::parse(requirement)
            .map_err(|e| Error::validation(format!("bad version requirement {:?}: {}", requirement, e)))?;
        Ok(Self::new(name, requirement, move |v| req.matches(v)))
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler<O>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn name(&self) -> &str { &self.name }

    /// Human-readable version selector.
    pub fn selector(&self) -> &str { &self.selector }

    pub fn handler_names(&self) -> Vec<&str> { self.handlers.iter().map(|h| h.name()).collect() }

    pub fn matches(&self, version: &Version) -> bool { (self.predicate)(version) }

    /// Invoke every handler in registration order until one cancels the remainder.
    pub async fn run(&self, pass: &PassContext, obj: &O) -> Result<PassReport> {
        let mut report = PassReport { resource_set: self.name.clone(), ..Default::default() };
        for handler in &self.handlers {
            let outcome = if pass.deleting {
                handler.ensure_deleted(pass, obj).await?
            } else {
                handler.ensure_created(pass, obj).await?
            };
            report.invoked.push(handler.name().to_string());
            report.outcome = report.outcome.merge(outcome);
            if outcome.cancel_remainder {
                debug!(set = %self.name, handler = handler.name(), keep_finalizer = outcome.keep_finalizer, "remainder of pass cancelled");
                report.cancelled_by = Some(handler.name().to_string());
                break;
            }
        }
        if !pass.deleting {
            report.outcome.keep_finalizer = false;
        }
        Ok(report)
    }
}

pub struct GenerationRouter<O: Send + Sync> {
    sets: Vec<ResourceSet<O>>,
}

impl<O: Declared> GenerationRouter<O> {
    pub fn new(sets: Vec<ResourceSet<O>>) -> Self { Self { sets } }

    pub fn sets(&self) -> &[ResourceSet<O>] { &self.sets }

    /// Resolve by raw version string. Malformed strings are validation errors,
    /// well-formed versions nobody serves are unroutable.
    pub fn resolve_version(&self, raw: &str) -> Result<&ResourceSet<O>> {
        let version = Version::parse(raw.trim())
            .map_err(|e| Error::validation(format!("bad schema version {:?}: {}", raw, e)))?;
        self.sets
            .iter()
            .find(|s| s.matches(&version))
            .ok_or_else(|| Error::UnroutableVersion { version: raw.to_string() })
    }

    pub fn resolve(&self, obj: &O) -> Result<&ResourceSet<O>> {
        match obj.schema_version() {
            Some(v) => self.resolve_version(&v),
            None => Err(Error::UnroutableVersion { version: String::new() }),
        }
    }

    pub async fn reconcile(&self, pass: &PassContext, obj: &O) -> Result<PassReport> {
        let set = self.resolve(obj)?;
        info!(set = %set.name(), deleting = pass.deleting, updates_allowed = pass.updates_allowed, "reconciling");
        set.run(pass, obj).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corral_core::{Cluster, ClusterSpec};
    use std::sync::Mutex;

    struct Step {
        name: &'static str,
        outcome: PassOutcome,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler<Cluster> for Step {
        fn name(&self) -> &str { self.name }

        async fn ensure_created(&self, _pass: &PassContext, _obj: &Cluster) -> Result<PassOutcome> {
            self.log.lock().unwrap().push(self.name);
            Ok(self.outcome)
        }

        async fn ensure_deleted(&self, pass: &PassContext, obj: &Cluster) -> Result<PassOutcome> {
            self.ensure_created(pass, obj).await
        }
    }

    fn cluster(version: &str) -> Cluster {
        Cluster::new("c", ClusterSpec { cluster_id: "c".into(), schema_version: version.into(), nodes: vec![] })
    }

    fn set(name: &str, req: &str, steps: &[(&'static str, PassOutcome)], log: &Arc<Mutex<Vec<&'static str>>>) -> ResourceSet<Cluster> {
        steps.iter().fold(ResourceSet::for_versions(name, req).unwrap(), |s, (n, o)| {
            s.with_handler(Arc::new(Step { name: *n, outcome: *o, log: log.clone() }))
        })
    }

    #[tokio::test]
    async fn handlers_run_in_order_until_cancelled() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let s = set("v2", ">=2.0.0", &[("a", PassOutcome::proceed()), ("b", PassOutcome::cancel()), ("c", PassOutcome::proceed())], &log);
        assert_eq!(s.handler_names(), vec!["a", "b", "c"]);

        let report = s.run(&PassContext::create(true), &cluster("2.0.0")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(report.invoked, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.cancelled_by.as_deref(), Some("b"));
        assert!(report.outcome.cancel_remainder);
    }

    #[tokio::test]
    async fn keep_finalizer_only_survives_delete_passes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let s = set("v1", ">=1.0.0", &[("gate", PassOutcome::cancel_and_keep_finalizer())], &log);
        let created = s.run(&PassContext::create(true), &cluster("1.0.0")).await.unwrap();
        assert!(!created.outcome.keep_finalizer);
        let deleted = s.run(&PassContext::delete(), &cluster("1.0.0")).await.unwrap();
        assert!(deleted.outcome.keep_finalizer);
    }

    #[test]
    fn first_matching_set_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = GenerationRouter::new(vec![
            set("v1", ">=1.0.0, <2.0.0", &[], &log),
            set("v2", ">=2.0.0, <3.0.0", &[], &log),
            set("catchall", ">=0.0.0", &[], &log),
        ]);
        assert_eq!(router.resolve(&cluster("1.4.2")).unwrap().name(), "v1");
        assert_eq!(router.resolve(&cluster("2.0.0")).unwrap().name(), "v2");
        assert_eq!(router.resolve(&cluster("5.1.0")).unwrap().name(), "catchall");
    }

    #[test]
    fn unknown_and_malformed_versions() {
        let router: GenerationRouter<Cluster> = GenerationRouter::new(vec![set("v1", ">=1.0.0, <2.0.0", &[], &Arc::default())]);
        assert!(matches!(router.resolve(&cluster("3.0.0")), Err(Error::UnroutableVersion { .. })));
        assert!(matches!(router.resolve(&cluster("1.0.0-rc.1")), Err(Error::UnroutableVersion { .. })));
        assert!(matches!(router.resolve(&cluster("v-one")), Err(Error::Validation(_))));
        assert!(matches!(ResourceSet::<Cluster>::for_versions("bad", "not-a-range"), Err(Error::Validation(_))));
    }
}
