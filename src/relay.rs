//! Volunteer relays: discovery and client sessions, plus the server side
//! that pairs peers and forwards their encrypted frames.
//!
//! Relays advertise a descriptor in the DHT under `relay:<node_id>`.
//! Clients rank descriptors by quality and register with the best one;
//! when both peers have registered, the relay creates a session and
//! forwards RELAY_MESSAGE frames verbatim. The relay never sees
//! plaintext, only peer IDs, sizes, and timing.

use crate::config::RelayConfig;
use crate::dht::{now_secs, DhtManager};
use crate::identity::NodeId;
use crate::p2p::P2pManager;
use crate::transport::RelayedPeerConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sessions with no traffic for this long are torn down.
const SESSION_STALE_SECS: f64 = 300.0;

/// Periodic re-publication of the relay descriptor.
const ANNOUNCE_INTERVAL_SECS: u64 = 900;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no available relays found")]
    NoRelays,

    #[error("relay refused registration: {0}")]
    Refused(String),

    #[error("timed out waiting for RELAY_READY")]
    RegisterTimeout,

    #[error("relay connection failed: {0}")]
    Connection(String),

    #[error("p2p manager not wired")]
    NotWired,
}

/// A volunteer relay's advertised capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    pub available: bool,
    pub max_peers: u32,
    #[serde(default)]
    pub current_peers: u32,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_uptime")]
    pub uptime: f64,
    #[serde(default = "default_latency")]
    pub latency_ms: f64,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_mbps: f64,
    #[serde(skip)]
    pub discovered_at: f64,
}

fn default_region() -> String {
    "global".to_string()
}
fn default_uptime() -> f64 {
    1.0
}
fn default_latency() -> f64 {
    100.0
}
fn default_bandwidth() -> f64 {
    10.0
}

impl RelayDescriptor {
    /// 1.0 = empty, 0.0 = full.
    pub fn capacity_score(&self) -> f64 {
        if self.max_peers == 0 {
            return 0.0;
        }
        1.0 - (self.current_peers as f64 / self.max_peers as f64)
    }

    /// 50% uptime, 30% free capacity, 20% latency (0 ms best, 500 ms
    /// worst).
    pub fn quality_score(&self) -> f64 {
        let latency_component = (1.0 - (self.latency_ms / 500.0)).clamp(0.0, 1.0);
        self.uptime * 0.5 + self.capacity_score() * 0.3 + latency_component * 0.2
    }

    pub fn is_full(&self) -> bool {
        self.current_peers >= self.max_peers
    }
}

/// An active pairing between two peers through this relay.
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub session_id: String,
    pub relay_id: NodeId,
    pub peer_a: NodeId,
    pub peer_b: NodeId,
    pub created_at: f64,
    pub last_activity: f64,
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
}

impl RelaySession {
    pub fn is_stale(&self, timeout: f64) -> bool {
        now_secs() - self.last_activity > timeout
    }

    pub fn involves(&self, node_id: &NodeId) -> bool {
        &self.peer_a == node_id || &self.peer_b == node_id
    }

    pub fn other(&self, node_id: &NodeId) -> Option<&NodeId> {
        if &self.peer_a == node_id {
            Some(&self.peer_b)
        } else if &self.peer_b == node_id {
            Some(&self.peer_a)
        } else {
            None
        }
    }
}

/// A one-sided RELAY_REGISTER waiting for its counterpart.
#[derive(Debug, Clone)]
struct PendingIntent {
    target: NodeId,
    deadline: f64,
}

#[derive(Debug, Clone)]
pub struct RelayStatsSnapshot {
    pub volunteer: bool,
    pub relays_discovered: u64,
    pub relay_connections: u64,
    pub sessions_created: u64,
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub active_sessions: usize,
}

pub struct RelayManager {
    self_id: NodeId,
    dht: Arc<DhtManager>,
    config: RelayConfig,
    p2p: OnceLock<Arc<P2pManager>>,

    // Server state
    sessions: Mutex<HashMap<String, RelaySession>>,
    peer_to_session: Mutex<HashMap<NodeId, String>>,
    pending: Mutex<HashMap<NodeId, PendingIntent>>,
    rate_windows: Mutex<HashMap<NodeId, Vec<f64>>>,

    // Client cache
    relay_cache: Mutex<(Vec<RelayDescriptor>, f64)>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    relays_discovered: AtomicU64,
    relay_connections: AtomicU64,
    sessions_created: AtomicU64,
    messages_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl RelayManager {
    pub fn new(self_id: NodeId, dht: Arc<DhtManager>, config: RelayConfig) -> Arc<Self> {
        info!(
            "RelayManager initialized (volunteer={}, max_peers={}, region={})",
            config.volunteer, config.max_peers, config.region
        );
        Arc::new(Self {
            self_id,
            dht,
            config,
            p2p: OnceLock::new(),
            sessions: Mutex::new(HashMap::new()),
            peer_to_session: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            rate_windows: Mutex::new(HashMap::new()),
            relay_cache: Mutex::new((Vec::new(), 0.0)),
            tasks: Mutex::new(Vec::new()),
            relays_discovered: AtomicU64::new(0),
            relay_connections: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        })
    }

    /// Late-bound back-reference; set once during wiring.
    pub fn set_p2p(&self, p2p: Arc<P2pManager>) {
        let _ = self.p2p.set(p2p);
    }

    fn p2p(&self) -> Result<&Arc<P2pManager>, RelayError> {
        self.p2p.get().ok_or(RelayError::NotWired)
    }

    /// Spawn descriptor announcements (volunteer only) and the session
    /// cleanup sweep.
    pub async fn start(self: &Arc<Self>) {
        if self.config.volunteer {
            let manager = Arc::clone(self);
            let announce = tokio::spawn(async move {
                loop {
                    manager.announce_relay_availability().await;
                    tokio::time::sleep(Duration::from_secs(ANNOUNCE_INTERVAL_SECS)).await;
                }
            });
            self.tasks.lock().await.push(announce);
        }

        let manager = Arc::clone(self);
        let cleanup = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                manager.cleanup_sessions().await;
            }
        });
        self.tasks.lock().await.push(cleanup);
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub async fn stats(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            volunteer: self.config.volunteer,
            relays_discovered: self.relays_discovered.load(Ordering::Relaxed),
            relay_connections: self.relay_connections.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            active_sessions: self.sessions.lock().await.len(),
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<RelaySession> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    // ===== Client mode =====

    /// Best available relay by quality score, with a short-lived cache.
    pub async fn find_relay(
        &self,
        prefer_region: Option<&str>,
        force_refresh: bool,
    ) -> Option<RelayDescriptor> {
        {
            let cache = self.relay_cache.lock().await;
            if !force_refresh
                && !cache.0.is_empty()
                && now_secs() - cache.1 < self.config.cache_timeout
            {
                debug!("Using cached relay list ({} relays)", cache.0.len());
                return select_best_relay(&cache.0, prefer_region);
            }
        }

        info!("Discovering relays via DHT (prefer_region={:?})", prefer_region);
        let mut relays = Vec::new();
        for peer in self.dht.known_peers().await {
            let key = format!("relay:{}", peer.node_id);
            let Some(crate::dht::FindValueResult::Value(value)) =
                self.dht.rpc().find_value(&peer.ip, peer.port, &key).await
            else {
                continue;
            };
            match serde_json::from_str::<RelayDescriptor>(&value) {
                Ok(mut descriptor) => {
                    descriptor.discovered_at = now_secs();
                    if descriptor.available && !descriptor.is_full() {
                        debug!(
                            "Found relay {} (capacity {}/{}, quality {:.2})",
                            descriptor.node_id.short(),
                            descriptor.current_peers,
                            descriptor.max_peers,
                            descriptor.quality_score()
                        );
                        relays.push(descriptor);
                    }
                }
                Err(e) => debug!("Unparseable relay descriptor from {}: {}", peer.node_id.short(), e),
            }
        }

        self.relays_discovered
            .fetch_add(relays.len() as u64, Ordering::Relaxed);
        *self.relay_cache.lock().await = (relays.clone(), now_secs());

        if relays.is_empty() {
            warn!("No available relays found in DHT");
            return None;
        }
        select_best_relay(&relays, prefer_region)
    }

    /// Register with the relay and wait for the session to form. Returns a
    /// relayed peer connection once RELAY_READY arrives.
    pub async fn connect_via_relay(
        &self,
        target_peer: &NodeId,
        relay: &RelayDescriptor,
    ) -> Result<Arc<RelayedPeerConnection>, RelayError> {
        info!(
            "Connecting to peer {} via relay {}",
            target_peer.short(),
            relay.node_id.short()
        );
        self.relay_connections.fetch_add(1, Ordering::Relaxed);

        let relay_conn = self
            .p2p()?
            .open_direct_connection(&relay.ip, relay.port, &relay.node_id)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        let register = json!({
            "command": "RELAY_REGISTER",
            "payload": {
                "peer_id": target_peer,
                "timeout": self.config.register_timeout,
            }
        });
        relay_conn
            .send(&register)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        // RELAY_WAITING keeps the wait alive; RELAY_READY carries the
        // session id; ERROR aborts.
        let session_id = tokio::time::timeout(
            Duration::from_secs_f64(self.config.register_timeout),
            async {
                loop {
                    let frame = relay_conn
                        .read()
                        .await
                        .map_err(|e| RelayError::Connection(e.to_string()))?
                        .ok_or_else(|| RelayError::Connection("relay closed".into()))?;

                    match frame.get("command").and_then(Value::as_str) {
                        Some("RELAY_READY") => {
                            let session_id = frame
                                .get("payload")
                                .and_then(|p| p.get("session_id"))
                                .and_then(Value::as_str)
                                .ok_or_else(|| {
                                    RelayError::Refused("RELAY_READY without session_id".into())
                                })?;
                            return Ok::<String, RelayError>(session_id.to_string());
                        }
                        Some("RELAY_WAITING") => {
                            debug!("Relay waiting for peer {}", target_peer.short());
                        }
                        Some("ERROR") => {
                            let reason = frame
                                .get("payload")
                                .and_then(|p| p.get("error"))
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string();
                            return Err(RelayError::Refused(reason));
                        }
                        _ => debug!("Ignoring frame while waiting for RELAY_READY"),
                    }
                }
            },
        )
        .await
        .map_err(|_| RelayError::RegisterTimeout)??;

        info!(
            "Relay session {} established via {}",
            session_id,
            relay.node_id.short()
        );
        Ok(RelayedPeerConnection::start(
            self.self_id.clone(),
            target_peer.clone(),
            relay.node_id.clone(),
            session_id,
            relay_conn,
        ))
    }

    // ===== Server mode =====

    /// Publish our relay descriptor under `relay:<self>`.
    pub async fn announce_relay_availability(&self) -> usize {
        if !self.config.volunteer {
            debug!("Not volunteering as relay - skipping announcement");
            return 0;
        }

        let descriptor = RelayDescriptor {
            node_id: self.self_id.clone(),
            ip: self.advertised_ip().await,
            port: self.advertised_port(),
            available: true,
            max_peers: self.config.max_peers as u32,
            current_peers: self.sessions.lock().await.len() as u32,
            region: self.config.region.clone(),
            uptime: 1.0,
            latency_ms: 50.0,
            bandwidth_mbps: self.config.bandwidth_limit_mbps,
            discovered_at: 0.0,
        };

        let key = format!("relay:{}", self.self_id);
        let value = serde_json::to_string(&descriptor).unwrap_or_default();
        let stored = self.dht.store_on_closest(&self.self_id, &key, &value).await;
        info!("Announced relay availability to {} DHT nodes", stored);
        stored
    }

    async fn advertised_ip(&self) -> String {
        match self.p2p.get() {
            Some(p2p) => p2p.advertised_ip().await,
            None => "0.0.0.0".to_string(),
        }
    }

    fn advertised_port(&self) -> u16 {
        match self.p2p.get() {
            Some(p2p) => p2p.listen_port(),
            None => crate::config::DEFAULT_P2P_PORT,
        }
    }

    /// RELAY_REGISTER from `requester`. Pairs with a matching pending
    /// intent or records a new one.
    pub async fn handle_register(&self, requester: NodeId, payload: Value) {
        let Ok(p2p) = self.p2p() else { return };

        if !self.config.volunteer {
            warn!(
                "Not volunteering as relay - rejecting registration from {}",
                requester.short()
            );
            self.send_error(&requester, "not_volunteering", "This node is not volunteering as a relay")
                .await;
            return;
        }

        let Some(target) = payload
            .get("peer_id")
            .and_then(Value::as_str)
            .and_then(|s| NodeId::parse(s).ok())
        else {
            warn!("RELAY_REGISTER missing peer_id from {}", requester.short());
            self.send_error(&requester, "invalid_request", "Missing peer_id in RELAY_REGISTER")
                .await;
            return;
        };

        if self.sessions.lock().await.len() >= self.config.max_peers {
            warn!(
                "Relay at capacity ({}) - rejecting registration from {}",
                self.config.max_peers,
                requester.short()
            );
            self.send_error(&requester, "not_volunteering", "Relay at capacity")
                .await;
            return;
        }

        info!(
            "Processing RELAY_REGISTER: requester={}, target={}",
            requester.short(),
            target.short()
        );

        // Second half of a pair already waiting?
        let matched = {
            let mut pending = self.pending.lock().await;
            match pending.get(&target) {
                Some(intent) if intent.target == requester && intent.deadline >= now_secs() => {
                    pending.remove(&target);
                    true
                }
                _ => false,
            }
        };

        if matched {
            let session_id = Uuid::new_v4().to_string();
            let session = RelaySession {
                session_id: session_id.clone(),
                relay_id: self.self_id.clone(),
                peer_a: requester.clone(),
                peer_b: target.clone(),
                created_at: now_secs(),
                last_activity: now_secs(),
                messages_relayed: 0,
                bytes_relayed: 0,
            };
            self.sessions
                .lock()
                .await
                .insert(session_id.clone(), session);
            let mut map = self.peer_to_session.lock().await;
            map.insert(requester.clone(), session_id.clone());
            map.insert(target.clone(), session_id.clone());
            drop(map);

            self.sessions_created.fetch_add(1, Ordering::Relaxed);
            info!(
                "Relay session created: {} (peers: {}, {})",
                session_id,
                requester.short(),
                target.short()
            );

            let ready_for_requester = json!({
                "command": "RELAY_READY",
                "payload": { "session_id": session_id, "peer_id": target }
            });
            let ready_for_target = json!({
                "command": "RELAY_READY",
                "payload": { "session_id": session_id, "peer_id": requester }
            });
            let _ = p2p.send_to_peer(&requester, &ready_for_requester).await;
            let _ = p2p.send_to_peer(&target, &ready_for_target).await;
        } else {
            let timeout = payload
                .get("timeout")
                .and_then(Value::as_f64)
                .unwrap_or(self.config.register_timeout);
            self.pending.lock().await.insert(
                requester.clone(),
                PendingIntent {
                    target: target.clone(),
                    deadline: now_secs() + timeout,
                },
            );

            debug!("Waiting for target peer {} to register", target.short());
            let waiting = json!({
                "command": "RELAY_WAITING",
                "payload": {
                    "message": format!("Waiting for peer {} to register", target.short()),
                    "timeout": timeout,
                }
            });
            let _ = p2p.send_to_peer(&requester, &waiting).await;
        }
    }

    /// RELAY_MESSAGE from `sender`: verify identity, session, and rate,
    /// then forward the frame verbatim to the destination.
    pub async fn handle_message(&self, sender: NodeId, payload: Value) {
        let Ok(p2p) = self.p2p() else { return };

        if !self.config.volunteer {
            self.send_error(&sender, "not_volunteering", "This node is not volunteering as a relay")
                .await;
            return;
        }

        let from = payload
            .get("from")
            .and_then(Value::as_str)
            .and_then(|s| NodeId::parse(s).ok());
        let to = payload
            .get("to")
            .and_then(Value::as_str)
            .and_then(|s| NodeId::parse(s).ok());
        let session_id = payload
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message_size = payload.get("message").map(|m| m.to_string().len() as u64);

        let (Some(from), Some(to), Some(session_id), Some(size)) =
            (from, to, session_id, message_size)
        else {
            self.send_error(&sender, "invalid_request", "Missing required fields in RELAY_MESSAGE")
                .await;
            return;
        };

        if from != sender {
            warn!(
                "RELAY_MESSAGE from field mismatch: connection={}, from={}",
                sender.short(),
                from.short()
            );
            self.send_error(&sender, "invalid_sender", "Sender ID does not match connection")
                .await;
            return;
        }

        // Both peers must share the claimed session
        let session_ok = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&session_id)
                .map(|s| s.involves(&from) && s.involves(&to))
                .unwrap_or(false)
        };
        if !session_ok {
            self.send_error(&sender, "forward_failed", "No shared relay session")
                .await;
            return;
        }

        if !self.check_rate_limit(&from).await {
            warn!("Rate limit exceeded for peer {}", from.short());
            self.send_error(&sender, "rate_limit_exceeded", "Per-sender message rate exceeded")
                .await;
            return;
        }

        let frame = json!({ "command": "RELAY_MESSAGE", "payload": payload });
        if let Err(e) = p2p.send_to_peer(&to, &frame).await {
            warn!("Failed to forward RELAY_MESSAGE to {}: {}", to.short(), e);
            self.send_error(&sender, "forward_failed", "Destination peer not connected")
                .await;
            return;
        }

        if let Some(session) = self.sessions.lock().await.get_mut(&session_id) {
            session.messages_relayed += 1;
            session.bytes_relayed += size;
            session.last_activity = now_secs();
        }
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(size, Ordering::Relaxed);
        debug!(
            "Relayed message {} -> {} ({} bytes, session={})",
            from.short(),
            to.short(),
            size,
            session_id
        );
    }

    /// RELAY_DISCONNECT from `sender`: verify participation, tear down,
    /// ack, and notify the other peer.
    pub async fn handle_disconnect(&self, sender: NodeId, payload: Value) {
        let Ok(p2p) = self.p2p() else { return };

        let Some(session_id) = payload.get("session_id").and_then(Value::as_str) else {
            self.send_error(&sender, "invalid_request", "Missing session_id in RELAY_DISCONNECT")
                .await;
            return;
        };
        let reason = payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unspecified")
            .to_string();

        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        let Some(session) = session else {
            self.send_error(&sender, "invalid_request", "Unknown relay session")
                .await;
            return;
        };
        if !session.involves(&sender) {
            self.send_error(&sender, "invalid_request", "Not a participant of this session")
                .await;
            return;
        }

        self.teardown_session(session_id).await;
        info!(
            "Relay session {} torn down ({}, reason={})",
            session_id,
            sender.short(),
            reason
        );

        let ack = json!({
            "command": "RELAY_DISCONNECT_ACK",
            "payload": { "session_id": session_id }
        });
        let _ = p2p.send_to_peer(&sender, &ack).await;

        if let Some(other) = session.other(&sender) {
            let notify = json!({
                "command": "RELAY_DISCONNECT",
                "payload": {
                    "peer": sender,
                    "session_id": session_id,
                    "reason": reason,
                }
            });
            let _ = p2p.send_to_peer(other, &notify).await;
        }
    }

    async fn teardown_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(session_id) {
            let mut map = self.peer_to_session.lock().await;
            map.remove(&session.peer_a);
            map.remove(&session.peer_b);
        }
    }

    async fn send_error(&self, to: &NodeId, error: &str, message: &str) {
        if let Ok(p2p) = self.p2p() {
            let frame = json!({
                "command": "ERROR",
                "payload": { "error": error, "message": message }
            });
            let _ = p2p.send_to_peer(to, &frame).await;
        }
    }

    /// Sliding one-second window per sender.
    async fn check_rate_limit(&self, node_id: &NodeId) -> bool {
        let now = now_secs();
        let limit = self.config.message_rate_limit as usize;
        let mut windows = self.rate_windows.lock().await;
        let timestamps = windows.entry(node_id.clone()).or_default();

        timestamps.retain(|t| now - t < 1.0);
        if timestamps.len() >= limit {
            return false;
        }
        timestamps.push(now);
        true
    }

    async fn cleanup_sessions(&self) {
        let stale: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|s| s.is_stale(SESSION_STALE_SECS))
                .map(|s| s.session_id.clone())
                .collect()
        };
        for session_id in stale {
            info!("Cleaning up stale relay session {}", session_id);
            self.teardown_session(&session_id).await;
        }

        let now = now_secs();
        self.pending.lock().await.retain(|_, i| i.deadline >= now);
    }
}

fn select_best_relay(
    relays: &[RelayDescriptor],
    prefer_region: Option<&str>,
) -> Option<RelayDescriptor> {
    let regional: Vec<&RelayDescriptor> = match prefer_region {
        Some(region) => {
            let filtered: Vec<&RelayDescriptor> =
                relays.iter().filter(|r| r.region == region).collect();
            if filtered.is_empty() {
                relays.iter().collect()
            } else {
                filtered
            }
        }
        None => relays.iter().collect(),
    };

    regional
        .into_iter()
        .max_by(|a, b| {
            a.quality_score()
                .partial_cmp(&b.quality_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(v: u128, uptime: f64, current: u32, latency: f64) -> RelayDescriptor {
        RelayDescriptor {
            node_id: NodeId::from_value(v),
            ip: "10.0.0.1".into(),
            port: 8888,
            available: true,
            max_peers: 10,
            current_peers: current,
            region: "global".into(),
            uptime,
            latency_ms: latency,
            bandwidth_mbps: 10.0,
            discovered_at: 0.0,
        }
    }

    #[test]
    fn test_quality_score() {
        let relay = descriptor(1, 0.95, 2, 50.0);
        // 0.5*0.95 + 0.3*0.8 + 0.2*0.9 = 0.895
        assert!((relay.quality_score() - 0.895).abs() < 1e-9);
    }

    #[test]
    fn test_capacity_and_full() {
        let mut relay = descriptor(1, 1.0, 3, 100.0);
        assert!((relay.capacity_score() - 0.7).abs() < 1e-9);
        assert!(!relay.is_full());
        relay.current_peers = 10;
        assert!(relay.is_full());
    }

    #[test]
    fn test_select_best_prefers_region_then_quality() {
        let mut eu = descriptor(1, 0.9, 0, 50.0);
        eu.region = "eu-central".into();
        let us = descriptor(2, 0.99, 0, 10.0);

        let relays = vec![eu.clone(), us.clone()];
        // Region preference wins even against a higher score
        let chosen = select_best_relay(&relays, Some("eu-central")).unwrap();
        assert_eq!(chosen.node_id, eu.node_id);
        // Without preference the best score wins
        let chosen = select_best_relay(&relays, None).unwrap();
        assert_eq!(chosen.node_id, us.node_id);
        // Unknown region falls back to all relays
        let chosen = select_best_relay(&relays, Some("ap-south")).unwrap();
        assert_eq!(chosen.node_id, us.node_id);
    }

    #[test]
    fn test_session_staleness() {
        let mut session = RelaySession {
            session_id: "s".into(),
            relay_id: NodeId::from_value(1),
            peer_a: NodeId::from_value(2),
            peer_b: NodeId::from_value(3),
            created_at: now_secs(),
            last_activity: now_secs(),
            messages_relayed: 0,
            bytes_relayed: 0,
        };
        assert!(!session.is_stale(300.0));
        session.last_activity = now_secs() - 400.0;
        assert!(session.is_stale(300.0));
        assert_eq!(session.other(&NodeId::from_value(2)), Some(&NodeId::from_value(3)));
        assert!(session.other(&NodeId::from_value(9)).is_none());
    }

    #[test]
    fn test_descriptor_serde_roundtrip() {
        let relay = descriptor(1, 0.9, 1, 80.0);
        let text = serde_json::to_string(&relay).unwrap();
        let back: RelayDescriptor = serde_json::from_str(&text).unwrap();
        assert_eq!(back.node_id, relay.node_id);
        assert_eq!(back.max_peers, 10);
    }
}
