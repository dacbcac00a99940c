//! Stable small-integer node indexes with hole reuse.
//!
//! Indexes start at 1, never move once assigned and are only released when
//! their node leaves the declaration. New nodes take the lowest free index.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{Cluster, NodeSpec, PassContext, PassOutcome, Result};
use corral_engine::Handler;
use corral_store::{typed, BackingStore};
use tracing::info;

/// Next index map for `nodes`, given the previously persisted one.
pub fn allocate(nodes: &[NodeSpec], previous: &BTreeMap<String, u32>) -> BTreeMap<String, u32> {
    let present: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let mut next: BTreeMap<String, u32> =
        previous.iter().filter(|(id, _)| present.contains(id.as_str())).map(|(id, i)| (id.clone(), *i)).collect();
    let mut taken: Vec<u32> = next.values().copied().collect();
    taken.sort_unstable();
    for node in nodes {
        if next.contains_key(&node.id) {
            continue;
        }
        let index = lowest_free(&taken);
        let at = taken.partition_point(|v| *v < index);
        taken.insert(at, index);
        next.insert(node.id.clone(), index);
    }
    next
}

/// First `i` with `sorted[i] != i + 1`, else `len + 1`.
fn lowest_free(sorted: &[u32]) -> u32 {
    sorted
        .iter()
        .enumerate()
        .find(|(i, v)| **v != *i as u32 + 1)
        .map(|(i, _)| i as u32 + 1)
        .unwrap_or(sorted.len() as u32 + 1)
}

/// Persists the index map in the cluster status and ends the pass when it
/// changed, so later handlers always see committed indexes.
pub struct NodeIndexAllocator {
    store: Arc<dyn BackingStore>,
}

impl NodeIndexAllocator {
    pub fn new(store: Arc<dyn BackingStore>) -> Self { Self { store } }
}

#[async_trait]
impl Handler<Cluster> for NodeIndexAllocator {
    fn name(&self) -> &str { "node_index" }

    async fn ensure_created(&self, _pass: &PassContext, cluster: &Cluster) -> Result<PassOutcome> {
        let previous = cluster.node_indexes();
        let next = allocate(&cluster.spec.nodes, &previous);
        if next == previous {
            return Ok(PassOutcome::proceed());
        }
        let mut updated = cluster.clone();
        updated.status.get_or_insert_with(Default::default).node_indexes = next.clone();
        typed::update_status(self.store.as_ref(), &updated).await?;
        info!(cluster = cluster.cluster_id(), indexes = ?next, "node indexes updated");
        Ok(PassOutcome::cancel())
    }

    async fn ensure_deleted(&self, _pass: &PassContext, _cluster: &Cluster) -> Result<PassOutcome> {
        Ok(PassOutcome::proceed())
    }
}
