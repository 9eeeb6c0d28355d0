//! Gossip message model: multi-hop envelope with TTL, hop limits, a
//! forwarding history, and a vector-clock snapshot.

use crate::dht::now_secs;
use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Forwarding urgency. Low-priority traffic is the first to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: String,
    pub source: NodeId,
    pub destination: NodeId,
    /// Sealed payload: `{"encrypted": "<base64>"}`.
    pub payload: Value,
    pub hops: u32,
    pub max_hops: u32,
    /// Monotonic set of forwarders, seeded with the source.
    #[serde(default)]
    pub already_forwarded: Vec<NodeId>,
    #[serde(default)]
    pub vector_clock: HashMap<NodeId, u64>,
    #[serde(default = "now_secs")]
    pub created_at: f64,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub priority: Priority,
}

fn default_ttl() -> u64 {
    86_400
}

impl GossipMessage {
    pub fn create(
        source: NodeId,
        destination: NodeId,
        payload: Value,
        max_hops: u32,
        ttl_seconds: u64,
        priority: Priority,
        vector_clock: HashMap<NodeId, u64>,
    ) -> Self {
        Self {
            id: format!("msg-{}", Uuid::new_v4()),
            source: source.clone(),
            destination,
            payload,
            hops: 0,
            max_hops,
            already_forwarded: vec![source],
            vector_clock,
            created_at: now_secs(),
            ttl_seconds,
            priority,
        }
    }

    /// Forwardable iff under the hop budget and not expired.
    pub fn can_forward(&self) -> bool {
        self.hops < self.max_hops && !self.is_expired()
    }

    pub fn is_expired(&self) -> bool {
        now_secs() > self.created_at + self.ttl_seconds as f64
    }

    /// Bump the hop count and record the forwarder.
    pub fn increment_hops(&mut self, forwarder: &NodeId) {
        self.hops += 1;
        if !self.already_forwarded.contains(forwarder) {
            self.already_forwarded.push(forwarder.clone());
        }
    }

    pub fn already_seen_by(&self, node_id: &NodeId) -> bool {
        self.already_forwarded.contains(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(v: u128) -> NodeId {
        NodeId::from_value(v)
    }

    fn msg() -> GossipMessage {
        GossipMessage::create(
            id(1),
            id(2),
            json!({"encrypted": "AAAA"}),
            5,
            86_400,
            Priority::Normal,
            HashMap::new(),
        )
    }

    #[test]
    fn test_create_seeds_forwarded_with_source() {
        let m = msg();
        assert!(m.id.starts_with("msg-"));
        assert_eq!(m.hops, 0);
        assert_eq!(m.already_forwarded, vec![id(1)]);
        assert!(m.can_forward());
    }

    #[test]
    fn test_hop_limit() {
        let mut m = msg();
        for i in 0..5u128 {
            assert!(m.can_forward());
            m.increment_hops(&id(10 + i));
        }
        assert_eq!(m.hops, 5);
        assert!(!m.can_forward());
    }

    #[test]
    fn test_increment_is_monotonic_set() {
        let mut m = msg();
        m.increment_hops(&id(3));
        m.increment_hops(&id(3));
        assert_eq!(m.hops, 2);
        assert_eq!(m.already_forwarded, vec![id(1), id(3)]);
        assert!(m.already_seen_by(&id(3)));
        assert!(!m.already_seen_by(&id(4)));
    }

    #[test]
    fn test_expiry() {
        let mut m = msg();
        m.ttl_seconds = 1;
        m.created_at = now_secs() - 10.0;
        assert!(m.is_expired());
        assert!(!m.can_forward());
    }

    #[test]
    fn test_serde_roundtrip() {
        let m = msg();
        let text = serde_json::to_string(&m).unwrap();
        let back: GossipMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, m.id);
        assert_eq!(back.source, m.source);
        assert_eq!(back.priority, Priority::Normal);
        assert_eq!(back.already_forwarded, m.already_forwarded);
    }
}
