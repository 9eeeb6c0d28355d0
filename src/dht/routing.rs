//! Kademlia routing table: 128 k-buckets with LRU discipline, bounded
//! replacement caches, and a per-/24 subnet diversity cap.

use super::distance::{bucket_index, distance};
use crate::identity::{NodeId, NODE_ID_BITS};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// UNIX seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("cannot add self to routing table")]
    SelfInsert,
}

/// A known DHT node. Equality and hashing are by node ID only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtNode {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    pub last_seen: f64,
    pub failed_pings: u32,
}

impl PartialEq for DhtNode {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for DhtNode {}

impl std::hash::Hash for DhtNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

impl DhtNode {
    pub fn new(node_id: NodeId, ip: String, port: u16) -> Self {
        Self {
            node_id,
            ip,
            port,
            last_seen: now_secs(),
            failed_pings: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = now_secs();
        self.failed_pings = 0;
    }

    pub fn mark_failed_ping(&mut self) {
        self.failed_pings += 1;
    }

    /// Not heard from within `timeout` seconds.
    pub fn is_stale(&self, timeout: f64) -> bool {
        now_secs() - self.last_seen > timeout
    }

    /// `/24` network (IPv4) or `/48` (IPv6) for diversity checks.
    /// Unparseable addresses fall back to the raw string.
    pub fn subnet(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                let o = v4.octets();
                format!("{}.{}.{}.0/24", o[0], o[1], o[2])
            }
            Ok(IpAddr::V6(v6)) => {
                let s = v6.segments();
                format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2])
            }
            Err(_) => self.ip.clone(),
        }
    }
}

/// One k-bucket: up to `k` records ordered oldest-first by `last_seen`,
/// plus a bounded replacement cache.
#[derive(Debug)]
pub struct KBucket {
    k: usize,
    subnet_diversity_limit: usize,
    stale_secs: f64,
    nodes: VecDeque<DhtNode>,
    replacement_cache: VecDeque<DhtNode>,
    last_updated: f64,
}

impl KBucket {
    pub fn new(k: usize, subnet_diversity_limit: usize, stale_secs: f64) -> Self {
        Self {
            k,
            subnet_diversity_limit,
            stale_secs,
            nodes: VecDeque::new(),
            replacement_cache: VecDeque::new(),
            last_updated: now_secs(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    pub fn replacement_len(&self) -> usize {
        self.replacement_cache.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DhtNode> {
        self.nodes.iter()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&DhtNode> {
        self.nodes.iter().find(|n| &n.node_id == node_id)
    }

    fn subnet_allows(&self, node: &DhtNode) -> bool {
        let subnet = node.subnet();
        let count = self.nodes.iter().filter(|n| n.subnet() == subnet).count();
        count < self.subnet_diversity_limit
    }

    /// Add with the LRU discipline:
    /// existing record → move to tail and refresh; room → append (subject
    /// to diversity); full with stale head → evict head and append; full
    /// otherwise → replacement cache.
    pub fn add(&mut self, node: DhtNode) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == node.node_id) {
            let mut existing = self.nodes.remove(pos).unwrap();
            existing.touch();
            self.nodes.push_back(existing);
            self.last_updated = now_secs();
            return true;
        }

        if !self.is_full() {
            if !self.subnet_allows(&node) {
                warn!(
                    "Subnet diversity limit: rejecting {} (subnet {})",
                    node.node_id.short(),
                    node.subnet()
                );
                return false;
            }
            self.nodes.push_back(node);
            self.last_updated = now_secs();
            return true;
        }

        let head_stale = self
            .nodes
            .front()
            .map(|head| head.is_stale(self.stale_secs))
            .unwrap_or(false);

        if head_stale {
            let evicted = self.nodes.pop_front().unwrap();
            debug!(
                "Evicting stale node {} (last seen {:.0}s ago)",
                evicted.node_id.short(),
                now_secs() - evicted.last_seen
            );
            if self.subnet_allows(&node) {
                self.nodes.push_back(node);
                self.last_updated = now_secs();
                return true;
            }
            warn!("Subnet diversity prevents adding {}", node.node_id.short());
            return false;
        }

        debug!(
            "Bucket full, caching {} as replacement",
            node.node_id.short()
        );
        if self.replacement_cache.len() >= self.k {
            self.replacement_cache.pop_front();
        }
        self.replacement_cache.push_back(node);
        false
    }

    /// Remove a record, promoting one replacement if available.
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| &n.node_id == node_id) else {
            return false;
        };
        self.nodes.remove(pos);

        if let Some(replacement) = self.replacement_cache.pop_front() {
            debug!(
                "Promoted {} from replacement cache",
                replacement.node_id.short()
            );
            self.nodes.push_back(replacement);
        }

        self.last_updated = now_secs();
        true
    }

    pub fn last_updated(&self) -> f64 {
        self.last_updated
    }

    /// Inactive for longer than `interval` seconds.
    pub fn needs_refresh(&self, interval: f64) -> bool {
        now_secs() - self.last_updated > interval
    }
}

/// 128 k-buckets indexed by `floor(log2(distance))`.
///
/// Not internally synchronized; the DHT manager wraps it in a lock.
#[derive(Debug)]
pub struct RoutingTable {
    node_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

#[derive(Debug, Clone)]
pub struct RoutingStats {
    pub total_nodes: usize,
    pub full_buckets: usize,
    pub empty_buckets: usize,
    pub non_empty_buckets: usize,
}

impl RoutingTable {
    pub fn new(node_id: NodeId, k: usize, subnet_diversity_limit: usize, stale_secs: f64) -> Self {
        let buckets = (0..NODE_ID_BITS as usize)
            .map(|_| KBucket::new(k, subnet_diversity_limit, stale_secs))
            .collect();
        Self { node_id, k, buckets }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn bucket_for(&self, node_id: &NodeId) -> Option<usize> {
        bucket_index(distance(&self.node_id, node_id))
    }

    /// Insert or refresh a node. Inserting self is a programmer error.
    pub fn add(&mut self, node_id: NodeId, ip: String, port: u16) -> Result<bool, RoutingError> {
        let Some(idx) = self.bucket_for(&node_id) else {
            return Err(RoutingError::SelfInsert);
        };
        let node = DhtNode::new(node_id, ip, port);
        Ok(self.buckets[idx].add(node))
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        match self.bucket_for(node_id) {
            Some(idx) => self.buckets[idx].remove(node_id),
            None => false,
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&DhtNode> {
        self.bucket_for(node_id)
            .and_then(|idx| self.buckets[idx].get(node_id))
    }

    /// Up to `count` nodes closest to `target`, ascending by distance.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<DhtNode> {
        let mut all: Vec<DhtNode> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes().cloned())
            .collect();
        all.sort_by_key(|n| distance(target, &n.node_id));
        all.truncate(count);
        all
    }

    pub fn all_nodes(&self) -> Vec<DhtNode> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes().cloned())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Indices of non-empty buckets inactive for `interval` seconds.
    pub fn buckets_needing_refresh(&self, interval: f64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.needs_refresh(interval))
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of non-empty buckets.
    pub fn non_empty_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn stats(&self) -> RoutingStats {
        let empty = self.buckets.iter().filter(|b| b.is_empty()).count();
        RoutingStats {
            total_nodes: self.node_count(),
            full_buckets: self.buckets.iter().filter(|b| b.is_full()).count(),
            empty_buckets: empty,
            non_empty_buckets: NODE_ID_BITS as usize - empty,
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_mut(&mut self, idx: usize) -> &mut KBucket {
        &mut self.buckets[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u128) -> NodeId {
        NodeId::from_value(v)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(id(0), 20, 2, 900.0)
    }

    #[test]
    fn test_add_and_find() {
        let mut rt = table();
        assert!(rt.add(id(1), "10.0.0.1".into(), 8889).unwrap());
        assert!(rt.add(id(2), "10.0.1.1".into(), 8889).unwrap());
        assert_eq!(rt.node_count(), 2);

        let closest = rt.find_closest(&id(1), 10);
        assert_eq!(closest[0].node_id, id(1));
        assert_eq!(closest[1].node_id, id(2));
    }

    #[test]
    fn test_self_insert_rejected() {
        let mut rt = table();
        assert!(rt.add(id(0), "10.0.0.1".into(), 8889).is_err());
    }

    #[test]
    fn test_no_duplicates_refresh_moves_to_tail() {
        let mut bucket = KBucket::new(20, 2, 900.0);
        bucket.add(DhtNode::new(id(1), "10.0.0.1".into(), 1));
        bucket.add(DhtNode::new(id(2), "10.0.1.1".into(), 2));

        // Re-adding node 1 refreshes it and moves it to the tail
        bucket.add(DhtNode::new(id(1), "10.0.0.1".into(), 1));
        assert_eq!(bucket.len(), 2);
        let order: Vec<u128> = bucket.nodes().map(|n| n.node_id.value()).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_subnet_diversity_cap() {
        let mut bucket = KBucket::new(20, 2, 900.0);
        assert!(bucket.add(DhtNode::new(id(1), "10.0.0.1".into(), 1)));
        assert!(bucket.add(DhtNode::new(id(2), "10.0.0.2".into(), 2)));
        // Third record in 10.0.0.0/24 is rejected
        assert!(!bucket.add(DhtNode::new(id(3), "10.0.0.3".into(), 3)));
        // A different /24 still fits
        assert!(bucket.add(DhtNode::new(id(4), "10.0.1.1".into(), 4)));
    }

    #[test]
    fn test_full_bucket_goes_to_replacement_cache() {
        let mut bucket = KBucket::new(4, 4, 900.0);
        for i in 1..=4u128 {
            assert!(bucket.add(DhtNode::new(id(i), format!("10.0.{i}.1"), 1)));
        }
        assert!(bucket.is_full());

        // Fresh head: newcomer lands in the replacement cache
        assert!(!bucket.add(DhtNode::new(id(5), "10.0.5.1".into(), 1)));
        assert_eq!(bucket.len(), 4);
        assert_eq!(bucket.replacement_len(), 1);
    }

    #[test]
    fn test_stale_head_evicted() {
        let mut bucket = KBucket::new(2, 2, 900.0);
        let mut old = DhtNode::new(id(1), "10.0.1.1".into(), 1);
        old.last_seen = now_secs() - 1000.0;
        bucket.add(old);
        bucket.add(DhtNode::new(id(2), "10.0.2.1".into(), 1));
        assert!(bucket.is_full());

        assert!(bucket.add(DhtNode::new(id(3), "10.0.3.1".into(), 1)));
        assert!(bucket.get(&id(1)).is_none());
        assert!(bucket.get(&id(3)).is_some());
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_remove_promotes_replacement() {
        let mut bucket = KBucket::new(2, 2, 900.0);
        bucket.add(DhtNode::new(id(1), "10.0.1.1".into(), 1));
        bucket.add(DhtNode::new(id(2), "10.0.2.1".into(), 1));
        bucket.add(DhtNode::new(id(3), "10.0.3.1".into(), 1)); // cached

        assert_eq!(bucket.replacement_len(), 1);
        assert!(bucket.remove(&id(1)));
        assert_eq!(bucket.replacement_len(), 0);
        assert_eq!(bucket.len(), 2);
        assert!(bucket.get(&id(3)).is_some());
    }

    #[test]
    fn test_find_closest_sorted_and_bounded() {
        let mut rt = table();
        for i in 1..=30u128 {
            let _ = rt.add(id(i), format!("10.{}.{}.1", i / 256, i % 256), 8889);
        }
        let closest = rt.find_closest(&id(0), 5);
        assert_eq!(closest.len(), 5);
        for w in closest.windows(2) {
            assert!(
                crate::dht::distance::distance(&id(0), &w[0].node_id)
                    <= crate::dht::distance::distance(&id(0), &w[1].node_id)
            );
        }
    }

    #[test]
    fn test_buckets_needing_refresh() {
        let mut rt = table();
        rt.add(id(1), "10.0.0.1".into(), 8889).unwrap();
        assert!(rt.buckets_needing_refresh(3600.0).is_empty());
        // Force the bucket's clock back
        rt.bucket_mut(0).last_updated = now_secs() - 4000.0;
        assert_eq!(rt.buckets_needing_refresh(3600.0), vec![0]);
    }
}
