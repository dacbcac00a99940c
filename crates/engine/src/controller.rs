//! Per-object reconciliation passes and the event loop driving them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use corral_core::{Error, ObjectKey, PassContext, Result};
use corral_store::{typed, BackingStore, Coalescer};
use kube::ResourceExt;
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::router::{Declared, GenerationRouter, PassReport};

/// Operator policy that can change while the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub updates_allowed: bool,
}

impl Default for Policy {
    fn default() -> Self { Self { updates_allowed: true } }
}

#[derive(Clone, Default)]
pub struct PolicyHandle {
    inner: Arc<ArcSwap<Policy>>,
}

impl PolicyHandle {
    pub fn new(policy: Policy) -> Self { Self { inner: Arc::new(ArcSwap::from_pointee(policy)) } }
    pub fn current(&self) -> Policy { **self.inner.load() }
    pub fn updates_allowed(&self) -> bool { self.current().updates_allowed }
    pub fn set_updates_allowed(&self, allowed: bool) {
        self.inner.store(Arc::new(Policy { updates_allowed: allowed }));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassResult {
    /// The object no longer exists.
    Gone,
    /// The object is being deleted and no longer carries our finalizer.
    Released,
    Completed(PassReport),
}

impl PassResult {
    fn label(&self) -> &'static str {
        match self {
            PassResult::Gone => "gone",
            PassResult::Released => "released",
            PassResult::Completed(r) if r.cancelled_by.is_some() => "cancelled",
            PassResult::Completed(_) => "completed",
        }
    }
}

pub struct Controller<O: Declared> {
    name: String,
    store: Arc<dyn BackingStore>,
    router: GenerationRouter<O>,
    finalizer: String,
    policy: PolicyHandle,
}

impl<O: Declared> Controller<O> {
    pub fn new(name: &str, store: Arc<dyn BackingStore>, router: GenerationRouter<O>, finalizer: &str, policy: PolicyHandle) -> Self {
        Self { name: name.to_string(), store, router, finalizer: finalizer.to_string(), policy }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn router(&self) -> &GenerationRouter<O> { &self.router }
    pub fn policy(&self) -> &PolicyHandle { &self.policy }

    fn holds_finalizer(&self, obj: &O) -> bool { obj.finalizers().iter().any(|f| f == &self.finalizer) }

    /// Run one reconciliation pass for the object behind `key`.
    ///
    /// The resource set is resolved before anything is written, so objects of a
    /// schema version this controller does not serve are left untouched.
    pub async fn run_pass(&self, key: &ObjectKey) -> Result<PassResult> {
        let store = self.store.as_ref();
        let Some(mut obj) = typed::get_opt::<O>(store, key.namespace.as_deref(), &key.name).await? else {
            return Ok(PassResult::Gone);
        };
        let deleting = obj.is_deleting();
        if deleting && !self.holds_finalizer(&obj) {
            return Ok(PassResult::Released);
        }
        let set = match self.router.resolve(&obj) {
            Ok(set) => set,
            Err(e) if deleting => {
                // our finalizer pins the object until a set that serves it can release it
                warn!(controller = %self.name, object = %key, error = %e, "deleting object no longer routes; finalizer held");
                let held = format!("finalizer {} held: {}", self.finalizer, e);
                if let Err(re) = self.record(key, Some(held)).await {
                    warn!(controller = %self.name, object = %key, error = %re, "could not record failure");
                }
                return Err(e);
            }
            Err(e) => {
                self.note_failure(key, &e).await;
                return Err(e);
            }
        };
        if !deleting && !self.holds_finalizer(&obj) {
            obj.finalizers_mut().push(self.finalizer.clone());
            obj = typed::update(store, &obj).await?;
            debug!(controller = %self.name, object = %key, "finalizer added");
        }
        let pass = if deleting { PassContext::delete() } else { PassContext::create(self.policy.updates_allowed()) };
        let report = match set.run(&pass, &obj).await {
            Ok(report) => report,
            Err(e) => {
                self.note_failure(key, &e).await;
                return Err(e);
            }
        };
        if deleting {
            if report.outcome.keep_finalizer {
                info!(controller = %self.name, object = %key, set = %report.resource_set, "finalizer kept");
            } else {
                self.release(key).await?;
            }
        } else {
            self.record(key, None).await?;
        }
        Ok(PassResult::Completed(report))
    }

    async fn release(&self, key: &ObjectKey) -> Result<()> {
        let store = self.store.as_ref();
        let Some(mut fresh) = typed::get_opt::<O>(store, key.namespace.as_deref(), &key.name).await? else {
            return Ok(());
        };
        let before = fresh.finalizers().len();
        fresh.finalizers_mut().retain(|f| f != &self.finalizer);
        if fresh.finalizers().len() != before {
            typed::update(store, &fresh).await?;
            info!(controller = %self.name, object = %key, "finalizer removed");
        }
        Ok(())
    }

    /// Write `message` as the object's last error if the kind records one.
    async fn record(&self, key: &ObjectKey, message: Option<String>) -> Result<()> {
        let store = self.store.as_ref();
        let Some(mut fresh) = typed::get_opt::<O>(store, key.namespace.as_deref(), &key.name).await? else {
            return Ok(());
        };
        if fresh.record_failure(message) {
            typed::update_status(store, &fresh).await?;
        }
        Ok(())
    }

    async fn note_failure(&self, key: &ObjectKey, err: &Error) {
        if !matches!(err, Error::Validation(_)) {
            return;
        }
        if let Err(e) = self.record(key, Some(err.to_string())).await {
            warn!(controller = %self.name, object = %key, error = %e, "could not record failure");
        }
    }
}

/// Event loop settings.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub queue_cap: usize,
    pub resync: Duration,
    pub namespace: Option<String>,
    pub selector: Option<String>,
}

/// Spawn the controller loop. Keys sent on the returned channel are coalesced,
/// passes for the same key never overlap, and every object matching the
/// namespace and selector is revisited each resync period.
pub fn spawn<O: Declared>(controller: Arc<Controller<O>>, opts: LoopOptions) -> (mpsc::Sender<ObjectKey>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ObjectKey>(opts.queue_cap.max(1));
    let handle = tokio::spawn(async move {
        let mut pending = Coalescer::with_capacity(opts.queue_cap);
        let mut running: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut by_task: FxHashMap<tokio::task::Id, ObjectKey> = FxHashMap::default();
        let mut tasks: JoinSet<(ObjectKey, Result<PassResult>)> = JoinSet::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let mut resync = tokio::time::interval(opts.resync.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(key) => pending.push(key),
                        None => {
                            debug!(controller = %controller.name(), "key channel closed; exiting loop");
                            break;
                        }
                    }
                }
                Some(done) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    match done {
                        Ok((id, (key, result))) => {
                            by_task.remove(&id);
                            running.remove(&key);
                            if requeue(controller.name(), &key, &result) {
                                pending.push(key);
                            }
                        }
                        Err(e) => {
                            if let Some(key) = by_task.remove(&e.id()) {
                                error!(controller = %controller.name(), object = %key, error = %e, "pass task failed");
                                running.remove(&key);
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = pending.drain_ready();
                    if batch.is_empty() {
                        continue;
                    }
                    let mut deferred = Vec::new();
                    for key in batch {
                        if running.contains(&key) {
                            deferred.push(key);
                            continue;
                        }
                        running.insert(key.clone());
                        let task_key = key.clone();
                        let ctl = Arc::clone(&controller);
                        let abort = tasks.spawn(async move {
                            let started = Instant::now();
                            let result = ctl.run_pass(&key).await;
                            let outcome = match &result {
                                Ok(r) => r.label(),
                                Err(e) => e.kind(),
                            };
                            counter!("corral_passes_total", 1u64, "controller" => ctl.name().to_string(), "result" => outcome);
                            histogram!("corral_pass_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => ctl.name().to_string());
                            (key, result)
                        });
                        by_task.insert(abort.id(), task_key);
                    }
                    for key in deferred {
                        pending.push(key);
                    }
                    gauge!("corral_passes_in_flight", running.len() as f64, "controller" => controller.name().to_string());
                }
                _ = resync.tick() => {
                    match list_keys::<O>(controller.as_ref(), &opts).await {
                        Ok(keys) => {
                            debug!(controller = %controller.name(), objects = keys.len(), "resync");
                            for key in keys {
                                pending.push(key);
                            }
                        }
                        Err(e) => warn!(controller = %controller.name(), error = %e, "resync list failed"),
                    }
                }
            }
        }
        while tasks.join_next().await.is_some() {}
        info!(controller = %controller.name(), "controller loop stopped");
    });
    (tx, handle)
}

/// Conflicts and transient failures go straight back on the queue; anything
/// else waits for the next event or resync.
fn requeue(controller: &str, key: &ObjectKey, result: &Result<PassResult>) -> bool {
    match result {
        Ok(r) => {
            debug!(controller, object = %key, result = r.label(), "pass finished");
            false
        }
        Err(e) if e.is_conflict() || e.is_retryable() => {
            debug!(controller, object = %key, error = %e, "pass raced; requeueing");
            true
        }
        Err(e @ Error::UnroutableVersion { .. }) => {
            debug!(controller, object = %key, error = %e, "not served by this controller");
            false
        }
        Err(e) => {
            warn!(controller, object = %key, error = %e, "pass failed");
            false
        }
    }
}

async fn list_keys<O: Declared>(controller: &Controller<O>, opts: &LoopOptions) -> Result<Vec<ObjectKey>> {
    let objs = typed::list::<O>(controller.store.as_ref(), opts.namespace.as_deref(), opts.selector.as_deref()).await?;
    Ok(objs.iter().map(|o| ObjectKey::new(o.namespace().as_deref(), &o.name_any())).collect())
}
