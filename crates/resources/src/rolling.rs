//! Rolling-update gate for replica groups.
//!
//! Disruptive updates are serialized across the fleet: nothing is touched
//! while any group is mid-rollout, and at most one group is updated per pass.

use corral_core::{keys, Result};
use corral_engine::{carry_version, drift};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    UpdatesDisabled,
    UnsafeToTouch { group: String },
    Converged,
    Update(Box<Deployment>),
}

/// A group is safe once available, ready, total and updated replica counts agree.
pub fn is_safe(group: &Deployment) -> bool {
    let status = group.status.clone().unwrap_or_default();
    let counts = [
        status.available_replicas.unwrap_or(0),
        status.ready_replicas.unwrap_or(0),
        status.replicas.unwrap_or(0),
        status.updated_replicas.unwrap_or(0),
    ];
    counts.iter().all(|c| *c == counts[0])
}

fn version_of(group: &Deployment) -> &str {
    group.annotations().get(keys::VERSION_ANNOTATION).map(|s| s.as_str()).unwrap_or("")
}

/// Version annotation first; on a match fall back to template drift.
pub fn is_modified(current: &Deployment, desired: &Deployment) -> Result<bool> {
    if version_of(current) != version_of(desired) {
        return Ok(true);
    }
    let live = current.spec.as_ref().map(|s| &s.template);
    let want = desired.spec.as_ref().map(|s| &s.template);
    Ok(drift(&want, &live)?.is_drift())
}

pub fn decide(updates_allowed: bool, current: &[Deployment], desired: &[Deployment]) -> Result<GateDecision> {
    if !updates_allowed {
        return Ok(GateDecision::UpdatesDisabled);
    }
    if let Some(busy) = current.iter().find(|g| !is_safe(g)) {
        return Ok(GateDecision::UnsafeToTouch { group: busy.name_any() });
    }
    // listing order decides which group goes first
    for live in current {
        let Some(want) = desired.iter().find(|d| d.name_any() == live.name_any() && d.namespace() == live.namespace()) else {
            continue;
        };
        if is_modified(live, want)? {
            return Ok(GateDecision::Update(Box::new(carry_version(live, want))));
        }
    }
    Ok(GateDecision::Converged)
}

/// Zero or one update for this pass.
pub fn gate_updates(updates_allowed: bool, current: &[Deployment], desired: &[Deployment]) -> Result<Vec<Deployment>> {
    match decide(updates_allowed, current, desired)? {
        GateDecision::UpdatesDisabled => {
            debug!("updates disabled for this pass");
            Ok(Vec::new())
        }
        GateDecision::UnsafeToTouch { group } => {
            warn!(group = %group, "replica group mid-rollout; holding updates");
            Ok(Vec::new())
        }
        GateDecision::Converged => Ok(Vec::new()),
        GateDecision::Update(next) => {
            debug!(group = %next.name_any(), "rolling one replica group");
            Ok(vec![*next])
        }
    }
}
