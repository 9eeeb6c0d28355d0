//! Persistent peer cache: last-known endpoints and capabilities per peer,
//! flushed to a JSON file on every mutation.

use crate::identity::NodeId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default direct-TLS port assumed for cached peers.
pub const DEFAULT_DIRECT_PORT: u16 = 8888;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPeer {
    pub node_id: NodeId,
    #[serde(default)]
    pub display_name: Option<String>,
    /// ISO-8601 UTC.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_direct_ip: Option<String>,
    #[serde(default = "default_direct_port")]
    pub last_direct_port: u16,
    #[serde(default)]
    pub supports_direct: bool,
    #[serde(default)]
    pub supports_webrtc: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_direct_port() -> u16 {
    DEFAULT_DIRECT_PORT
}

impl CachedPeer {
    pub fn is_recently_seen(&self, hours: i64) -> bool {
        match self.last_seen {
            Some(ts) => ts >= Utc::now() - Duration::hours(hours),
            None => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    version: String,
    last_updated: DateTime<Utc>,
    peers: Vec<CachedPeer>,
}

/// Update applied by [`PeerCache::add_or_update`]. Unset fields leave the
/// existing record alone.
#[derive(Debug, Default, Clone)]
pub struct PeerUpdate {
    pub display_name: Option<String>,
    pub direct_ip: Option<String>,
    pub direct_port: Option<u16>,
    pub supports_direct: Option<bool>,
    pub supports_webrtc: Option<bool>,
    pub metadata: HashMap<String, Value>,
}

pub struct PeerCache {
    path: PathBuf,
    peers: HashMap<NodeId, CachedPeer>,
}

impl PeerCache {
    /// Load from disk; a missing or unreadable file starts fresh.
    pub fn load(path: PathBuf) -> Self {
        let peers = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<CacheDocument>(&data) {
                Ok(doc) => {
                    info!("Loaded {} peers from cache", doc.peers.len());
                    doc.peers
                        .into_iter()
                        .map(|p| (p.node_id.clone(), p))
                        .collect()
                }
                Err(e) => {
                    warn!("Peer cache unreadable ({}), starting fresh", e);
                    HashMap::new()
                }
            },
            Err(_) => {
                debug!("Peer cache not found at {:?}, starting fresh", path);
                HashMap::new()
            }
        };
        Self { path, peers }
    }

    fn save(&self) {
        let doc = CacheDocument {
            version: "1.0".to_string(),
            last_updated: Utc::now(),
            peers: self.peers.values().cloned().collect(),
        };

        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create peer cache directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(&doc) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.path, data) {
                    warn!("Failed to save peer cache: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize peer cache: {}", e),
        }
    }

    /// Insert or update a peer, refresh `last_seen`, and flush.
    pub fn add_or_update(&mut self, node_id: &NodeId, update: PeerUpdate) {
        let peer = self
            .peers
            .entry(node_id.clone())
            .or_insert_with(|| CachedPeer {
                node_id: node_id.clone(),
                display_name: None,
                last_seen: None,
                last_direct_ip: None,
                last_direct_port: DEFAULT_DIRECT_PORT,
                supports_direct: false,
                supports_webrtc: false,
                metadata: HashMap::new(),
            });

        if let Some(name) = update.display_name {
            peer.display_name = Some(name);
        }
        if let Some(ip) = update.direct_ip {
            peer.last_direct_ip = Some(ip);
            peer.last_direct_port = update.direct_port.unwrap_or(DEFAULT_DIRECT_PORT);
        }
        if let Some(direct) = update.supports_direct {
            peer.supports_direct = direct;
        }
        if let Some(webrtc) = update.supports_webrtc {
            peer.supports_webrtc = webrtc;
        }
        peer.metadata.extend(update.metadata);
        peer.last_seen = Some(Utc::now());

        self.save();
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&CachedPeer> {
        self.peers.get(node_id)
    }

    pub fn all(&self) -> Vec<&CachedPeer> {
        self.peers.values().collect()
    }

    pub fn recent(&self, hours: i64) -> Vec<&CachedPeer> {
        self.peers
            .values()
            .filter(|p| p.is_recently_seen(hours))
            .collect()
    }

    pub fn with_direct_connection(&self) -> Vec<&CachedPeer> {
        self.peers
            .values()
            .filter(|p| p.supports_direct && p.last_direct_ip.is_some())
            .collect()
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let removed = self.peers.remove(node_id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.save();
    }

    /// Drop peers not seen for `days` days.
    pub fn cleanup_old(&mut self, days: i64) -> usize {
        let threshold = Utc::now() - Duration::days(days);
        let before = self.peers.len();
        self.peers.retain(|_, p| match p.last_seen {
            Some(ts) => ts >= threshold,
            None => true,
        });
        let removed = before - self.peers.len();
        if removed > 0 {
            info!("Cleaned up {} old peers", removed);
            self.save();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u128) -> NodeId {
        NodeId::from_value(v)
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("meshcore_cache_{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_add_get_update() {
        let path = scratch("add");
        let _ = std::fs::remove_file(&path);
        let mut cache = PeerCache::load(path.clone());

        cache.add_or_update(
            &id(1),
            PeerUpdate {
                display_name: Some("Alice".into()),
                direct_ip: Some("192.168.1.100".into()),
                supports_direct: Some(true),
                ..Default::default()
            },
        );

        let peer = cache.get(&id(1)).unwrap();
        assert_eq!(peer.display_name.as_deref(), Some("Alice"));
        assert_eq!(peer.last_direct_ip.as_deref(), Some("192.168.1.100"));
        assert_eq!(peer.last_direct_port, DEFAULT_DIRECT_PORT);
        assert!(peer.supports_direct);

        // Update keeps fields that were not set
        cache.add_or_update(
            &id(1),
            PeerUpdate {
                supports_webrtc: Some(true),
                ..Default::default()
            },
        );
        let peer = cache.get(&id(1)).unwrap();
        assert!(peer.supports_direct);
        assert!(peer.supports_webrtc);
        assert_eq!(peer.display_name.as_deref(), Some("Alice"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_persistence_roundtrip() {
        let path = scratch("persist");
        let _ = std::fs::remove_file(&path);
        {
            let mut cache = PeerCache::load(path.clone());
            cache.add_or_update(
                &id(7),
                PeerUpdate {
                    direct_ip: Some("10.0.0.7".into()),
                    direct_port: Some(9001),
                    supports_direct: Some(true),
                    ..Default::default()
                },
            );
        }
        let cache = PeerCache::load(path.clone());
        let peer = cache.get(&id(7)).unwrap();
        assert_eq!(peer.last_direct_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(peer.last_direct_port, 9001);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_recent_and_direct_filters() {
        let path = scratch("filters");
        let _ = std::fs::remove_file(&path);
        let mut cache = PeerCache::load(path.clone());

        cache.add_or_update(
            &id(1),
            PeerUpdate {
                direct_ip: Some("10.0.0.1".into()),
                supports_direct: Some(true),
                ..Default::default()
            },
        );
        cache.add_or_update(&id(2), PeerUpdate::default());

        assert_eq!(cache.recent(24).len(), 2);
        assert_eq!(cache.with_direct_connection().len(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_remove_and_clear() {
        let path = scratch("remove");
        let _ = std::fs::remove_file(&path);
        let mut cache = PeerCache::load(path.clone());

        cache.add_or_update(&id(1), PeerUpdate::default());
        cache.add_or_update(&id(2), PeerUpdate::default());
        assert!(cache.remove(&id(1)));
        assert!(!cache.remove(&id(1)));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());

        std::fs::remove_file(&path).ok();
    }
}
