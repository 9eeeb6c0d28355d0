//! Vector clocks for causality tracking across gossip messages.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-node logical timestamps. Incremented on local events, merged
/// (element-wise max) when a message arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorClock {
    node_id: NodeId,
    clock: HashMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            clock: HashMap::new(),
        }
    }

    pub fn from_map(node_id: NodeId, clock: HashMap<NodeId, u64>) -> Self {
        Self { node_id, clock }
    }

    /// Raise our own entry by one (a locally originating event).
    pub fn increment(&mut self) {
        *self.clock.entry(self.node_id.clone()).or_insert(0) += 1;
    }

    /// Element-wise maximum with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &ts) in &other.clock {
            let entry = self.clock.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(ts);
        }
    }

    /// Strict causality: every entry `self ≤ other`, at least one strictly
    /// less.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;
        for node in self.clock.keys().chain(other.clock.keys()) {
            let ours = self.get(node);
            let theirs = other.get(node);
            if ours > theirs {
                return false;
            }
            if ours < theirs {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// Neither clock happens before the other (and they are not equal).
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self)
            && !self.equals(other)
    }

    pub fn equals(&self, other: &VectorClock) -> bool {
        self.clock
            .keys()
            .chain(other.clock.keys())
            .all(|node| self.get(node) == other.get(node))
    }

    pub fn get(&self, node_id: &NodeId) -> u64 {
        self.clock.get(node_id).copied().unwrap_or(0)
    }

    pub fn to_map(&self) -> HashMap<NodeId, u64> {
        self.clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u128) -> NodeId {
        NodeId::from_value(v)
    }

    #[test]
    fn test_increment() {
        let mut clock = VectorClock::new(id(1));
        clock.increment();
        clock.increment();
        assert_eq!(clock.get(&id(1)), 2);
        assert_eq!(clock.get(&id(2)), 0);
    }

    #[test]
    fn test_merge_takes_max() {
        let mut a = VectorClock::from_map(
            id(1),
            HashMap::from([(id(1), 5), (id(2), 3)]),
        );
        let b = VectorClock::from_map(
            id(2),
            HashMap::from([(id(1), 4), (id(2), 7)]),
        );
        a.merge(&b);
        assert_eq!(a.get(&id(1)), 5);
        assert_eq!(a.get(&id(2)), 7);
    }

    #[test]
    fn test_happens_before() {
        let a = VectorClock::from_map(id(1), HashMap::from([(id(1), 1), (id(2), 2)]));
        let b = VectorClock::from_map(id(2), HashMap::from([(id(1), 2), (id(2), 3)]));
        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn test_concurrent() {
        let a = VectorClock::from_map(id(1), HashMap::from([(id(1), 5), (id(2), 1)]));
        let b = VectorClock::from_map(id(2), HashMap::from([(id(1), 1), (id(2), 5)]));
        assert!(a.concurrent_with(&b));
        assert!(b.concurrent_with(&a));
    }

    #[test]
    fn test_equality_and_concurrency_exclusive() {
        let a = VectorClock::from_map(id(1), HashMap::from([(id(1), 3), (id(2), 2)]));
        let b = VectorClock::from_map(id(2), HashMap::from([(id(1), 3), (id(2), 2)]));
        assert!(a.equals(&b));
        assert!(!a.concurrent_with(&b));
        assert!(!a.happens_before(&b));
    }

    #[test]
    fn test_merge_breaks_happens_before() {
        let mut a = VectorClock::from_map(id(1), HashMap::from([(id(1), 1)]));
        let b = VectorClock::from_map(id(2), HashMap::from([(id(2), 4)]));
        assert!(!b.happens_before(&a));
        a.merge(&b);
        // After merging, a is at least as advanced as b everywhere
        assert!(!a.happens_before(&b));
    }
}
