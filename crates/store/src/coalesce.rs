use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::FxHashSet;

/// Coalescing queue keyed by object with FIFO order and fixed capacity.
///
/// Repeated events for a key already queued collapse into one pending pass.
/// On overflow the oldest key is dropped; the next resync picks it up again.
pub struct Coalescer<K> {
    pending: FxHashSet<K>,
    order: VecDeque<K>,
    cap: usize,
    dropped: u64,
}

impl<K: Eq + Hash + Clone> Coalescer<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { pending: FxHashSet::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.pending.len() }
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, key: K) {
        if self.pending.contains(&key) { return; }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.pending.remove(&old);
                self.dropped += 1;
                metrics::counter!("corral_queue_dropped_total", 1u64);
            }
        }
        self.pending.insert(key.clone());
        self.order.push_back(key);
    }

    /// Drain all currently coalesced keys in arrival order.
    pub fn drain_ready(&mut self) -> Vec<K> {
        self.pending.clear();
        self.order.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_collapse_and_order_is_kept() {
        let mut c = Coalescer::with_capacity(8);
        for k in ["a", "b", "a", "c", "b"] { c.push(k.to_string()); }
        assert_eq!(c.len(), 3);
        assert_eq!(c.drain_ready(), vec!["a", "b", "c"]);
        assert!(c.is_empty());
        c.push("a".to_string());
        assert_eq!(c.drain_ready(), vec!["a"]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut c = Coalescer::with_capacity(2);
        c.push(1);
        c.push(2);
        c.push(3);
        assert_eq!(c.dropped(), 1);
        assert_eq!(c.drain_ready(), vec![2, 3]);
    }
}
