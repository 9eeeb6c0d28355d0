//! Epidemic gossip: store-and-forward messaging with end-to-end sealing,
//! deduplication, vector-clock anti-entropy, and TTL-driven cleanup.
//!
//! Last-resort delivery tier: each node forwards to a small random subset
//! of its connected peers until the destination is reached or the message
//! expires. Intermediate hops see only sealed blobs.

pub mod clock;
pub mod message;

pub use clock::VectorClock;
pub use message::{GossipMessage, Priority};

use crate::config::GossipConfig;
use crate::dht::DhtManager;
use crate::identity::{public_key_from_cert_pem, NodeId};
use crate::p2p::P2pManager;
use crate::router::MessageRouter;
use rand::seq::SliceRandom;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("cannot find certificate for {0}")]
    CertificateNotFound(String),

    #[error("sealing failed: {0}")]
    Seal(#[from] crate::crypto::SealError),

    #[error("p2p manager not wired")]
    NotWired,
}

#[derive(Debug, Clone)]
pub struct GossipStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub sync_cycles: u64,
    pub messages_stored: usize,
}

pub struct GossipManager {
    node_id: NodeId,
    private_key: Arc<RsaPrivateKey>,
    cert_pem: String,
    dht: Arc<DhtManager>,
    config: GossipConfig,
    p2p: OnceLock<Arc<P2pManager>>,
    router: OnceLock<Arc<MessageRouter>>,

    messages: Mutex<HashMap<String, GossipMessage>>,
    seen: Mutex<HashSet<String>>,
    clock: Mutex<VectorClock>,
    deliveries: Mutex<HashMap<NodeId, mpsc::Sender<Value>>>,
    peer_keys: Mutex<HashMap<NodeId, RsaPublicKey>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    sent: AtomicU64,
    received: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    sync_cycles: AtomicU64,
}

impl GossipManager {
    pub fn new(
        node_id: NodeId,
        private_key: Arc<RsaPrivateKey>,
        cert_pem: String,
        dht: Arc<DhtManager>,
        config: GossipConfig,
    ) -> Arc<Self> {
        info!(
            "GossipManager initialized (fanout={}, max_hops={}, ttl={}s)",
            config.fanout, config.max_hops, config.ttl_seconds
        );
        Arc::new(Self {
            node_id: node_id.clone(),
            private_key,
            cert_pem,
            dht,
            config,
            p2p: OnceLock::new(),
            router: OnceLock::new(),
            messages: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            clock: Mutex::new(VectorClock::new(node_id)),
            deliveries: Mutex::new(HashMap::new()),
            peer_keys: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sync_cycles: AtomicU64::new(0),
        })
    }

    pub fn set_p2p(&self, p2p: Arc<P2pManager>) {
        let _ = self.p2p.set(p2p);
    }

    pub fn set_router(&self, router: Arc<MessageRouter>) {
        let _ = self.router.set(router);
    }

    /// Publish our certificate and start the anti-entropy and cleanup
    /// loops.
    pub async fn start(self: &Arc<Self>) {
        {
            let manager = Arc::clone(self);
            let publish = tokio::spawn(async move {
                manager.publish_certificate().await;
            });
            self.tasks.lock().await.push(publish);
        }

        let sync = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.anti_entropy_loop().await })
        };
        let cleanup = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.cleanup_loop().await })
        };
        self.tasks.lock().await.extend([sync, cleanup]);
        info!("GossipManager started");
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("GossipManager stopped");
    }

    pub async fn stats(&self) -> GossipStatsSnapshot {
        GossipStatsSnapshot {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            messages_forwarded: self.forwarded.load(Ordering::Relaxed),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            sync_cycles: self.sync_cycles.load(Ordering::Relaxed),
            messages_stored: self.messages.lock().await.len(),
        }
    }

    pub async fn clock_snapshot(&self) -> VectorClock {
        self.clock.lock().await.clone()
    }

    // ===== Delivery registration (gossip virtual connections) =====

    /// Deliveries from `peer_id` flow into the returned channel instead of
    /// the message router.
    pub async fn register_delivery(&self, peer_id: &NodeId) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        self.deliveries.lock().await.insert(peer_id.clone(), tx);
        debug!("Registered delivery channel for {}", peer_id.short());
        rx
    }

    pub async fn unregister_delivery(&self, peer_id: &NodeId) {
        if self.deliveries.lock().await.remove(peer_id).is_some() {
            debug!("Unregistered delivery channel for {}", peer_id.short());
        }
    }

    // ===== Sending =====

    /// Seal `payload` for `destination` and start epidemic spreading.
    /// Returns the message id.
    pub async fn send_gossip(
        &self,
        destination: &NodeId,
        payload: Value,
        priority: Option<Priority>,
    ) -> Result<String, GossipError> {
        self.clock.lock().await.increment();

        let recipient_key = self
            .peer_public_key(destination)
            .await
            .ok_or_else(|| GossipError::CertificateNotFound(destination.to_string()))?;

        let payload_bytes = payload.to_string().into_bytes();
        let sealed = crate::crypto::seal(&payload_bytes, &recipient_key)?;
        let encrypted = BASE64.encode(sealed);
        debug!(
            "Sealed gossip payload for {} ({} chars base64)",
            destination.short(),
            encrypted.len()
        );

        let priority = priority.unwrap_or_else(|| match self.config.default_priority.as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        });
        let clock_snapshot = self.clock.lock().await.to_map();
        let mut msg = GossipMessage::create(
            self.node_id.clone(),
            destination.clone(),
            json!({ "encrypted": encrypted }),
            self.config.max_hops,
            self.config.ttl_seconds,
            priority,
            clock_snapshot,
        );

        self.messages
            .lock()
            .await
            .insert(msg.id.clone(), msg.clone());
        self.seen.lock().await.insert(msg.id.clone());
        self.sent.fetch_add(1, Ordering::Relaxed);

        info!(
            "Created gossip message {} (dst={}, priority={:?})",
            msg.id,
            destination.short(),
            msg.priority
        );
        self.forward(&mut msg).await;
        Ok(msg.id)
    }

    // ===== Receiving =====

    /// Incoming GOSSIP_MESSAGE: deliver, dedupe, or store-and-forward.
    pub async fn handle_gossip_message(&self, mut msg: GossipMessage) {
        debug!(
            "Received gossip message {} (src={}, dst={}, hops={}/{})",
            msg.id,
            msg.source.short(),
            msg.destination.short(),
            msg.hops,
            msg.max_hops
        );
        self.received.fetch_add(1, Ordering::Relaxed);

        if msg.destination == self.node_id {
            self.deliver(msg).await;
            return;
        }

        if self.seen.lock().await.contains(&msg.id) {
            debug!("Message {} already seen - ignoring", msg.id);
            return;
        }

        if msg.is_expired() || !msg.can_forward() {
            debug!("Message {} expired or out of hops - dropping", msg.id);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.messages
            .lock()
            .await
            .insert(msg.id.clone(), msg.clone());
        self.seen.lock().await.insert(msg.id.clone());

        let other = VectorClock::from_map(self.node_id.clone(), msg.vector_clock.clone());
        self.clock.lock().await.merge(&other);

        self.forward(&mut msg).await;
    }

    /// Unseal and hand a message addressed to us to its consumer.
    async fn deliver(&self, msg: GossipMessage) {
        if !self.seen.lock().await.insert(msg.id.clone()) {
            debug!("Duplicate delivery of {} suppressed", msg.id);
            return;
        }

        info!(
            "Delivering gossip message {} from {} (hops {})",
            msg.id,
            msg.source.short(),
            msg.hops
        );

        let Some(encrypted) = msg.payload.get("encrypted").and_then(Value::as_str) else {
            warn!("Gossip message {} missing sealed payload", msg.id);
            return;
        };
        let Ok(blob) = BASE64.decode(encrypted) else {
            warn!("Gossip message {} carries invalid base64", msg.id);
            return;
        };
        // Authentication failure aborts delivery
        let opened = match crate::crypto::open(&blob, &self.private_key) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to open gossip message {}: {}", msg.id, e);
                return;
            }
        };
        let payload: Value = match serde_json::from_slice(&opened) {
            Ok(v) => v,
            Err(e) => {
                warn!("Gossip message {} payload is not JSON: {}", msg.id, e);
                return;
            }
        };

        self.delivered.fetch_add(1, Ordering::Relaxed);

        let channel = self.deliveries.lock().await.get(&msg.source).cloned();
        let payload = match channel {
            Some(tx) => match tx.send(payload).await {
                Ok(()) => return,
                // Receiver side went away; reclaim the payload and fall
                // through to the router
                Err(e) => e.0,
            },
            None => payload,
        };
        if let Some(router) = self.router.get() {
            router.route(msg.source.clone(), &payload).await;
        } else {
            info!(
                "No consumer for gossip message from {}: {}",
                msg.source.short(),
                payload
            );
        }
    }

    /// Epidemic step: send to `fanout` random connected peers that have
    /// not already carried this message.
    async fn forward(&self, msg: &mut GossipMessage) {
        let Some(p2p) = self.p2p.get() else {
            warn!("No P2P manager - cannot forward gossip");
            return;
        };

        let peers = p2p.connected_peer_ids().await;
        if peers.is_empty() {
            debug!("No connected peers - cannot forward message {}", msg.id);
            return;
        }

        let mut eligible: Vec<NodeId> = peers
            .into_iter()
            .filter(|p| !msg.already_seen_by(p))
            .collect();
        if eligible.is_empty() {
            debug!("No eligible peers for message {}", msg.id);
            return;
        }

        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(self.config.fanout);

        msg.increment_hops(&self.node_id);
        self.messages
            .lock()
            .await
            .insert(msg.id.clone(), msg.clone());

        let frame = json!({
            "command": "GOSSIP_MESSAGE",
            "payload": serde_json::to_value(&*msg).unwrap_or(Value::Null),
        });
        for peer in eligible {
            match p2p.send_to_peer(&peer, &frame).await {
                Ok(()) => {
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                    debug!("Forwarded {} to {} (hops={})", msg.id, peer.short(), msg.hops);
                }
                Err(e) => debug!("Failed to forward {} to {}: {}", msg.id, peer.short(), e),
            }
        }
    }

    // ===== Anti-entropy =====

    /// GOSSIP_SYNC from a peer: forward every stored message the peer has
    /// not listed.
    pub async fn handle_gossip_sync(&self, peer_id: NodeId, payload: Value) {
        debug!("Handling GOSSIP_SYNC from {}", peer_id.short());

        if let Some(clock_value) = payload.get("vector_clock") {
            if let Ok(map) = serde_json::from_value(clock_value.clone()) {
                let other = VectorClock::from_map(self.node_id.clone(), map);
                self.clock.lock().await.merge(&other);
            }
        }

        let their_ids: HashSet<String> = payload
            .get("message_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let missing: Vec<GossipMessage> = {
            let messages = self.messages.lock().await;
            messages
                .values()
                .filter(|m| !their_ids.contains(&m.id))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        info!(
            "Sending {} missing messages to {}",
            missing.len(),
            peer_id.short()
        );
        let Some(p2p) = self.p2p.get() else { return };
        for msg in missing {
            let frame = json!({
                "command": "GOSSIP_MESSAGE",
                "payload": serde_json::to_value(&msg).unwrap_or(Value::Null),
            });
            if let Err(e) = p2p.send_to_peer(&peer_id, &frame).await {
                debug!("Failed to send missing message {}: {}", msg.id, e);
            }
        }
    }

    async fn anti_entropy_loop(&self) {
        info!(
            "Anti-entropy sync loop started (interval={:.0}s)",
            self.config.sync_interval
        );
        loop {
            tokio::time::sleep(Duration::from_secs_f64(self.config.sync_interval)).await;

            let Some(p2p) = self.p2p.get() else { continue };
            let peers = p2p.connected_peer_ids().await;
            let Some(peer) = peers.choose(&mut rand::thread_rng()).cloned() else {
                continue;
            };

            debug!("Anti-entropy sync with {}", peer.short());
            let (clock_map, message_ids) = {
                let clock = self.clock.lock().await.to_map();
                let ids: Vec<String> = self.messages.lock().await.keys().cloned().collect();
                (clock, ids)
            };
            let frame = json!({
                "command": "GOSSIP_SYNC",
                "payload": {
                    "vector_clock": clock_map,
                    "message_ids": message_ids,
                }
            });
            if p2p.send_to_peer(&peer, &frame).await.is_ok() {
                self.sync_cycles.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn cleanup_loop(&self) {
        info!(
            "Gossip cleanup loop started (interval={:.0}s)",
            self.config.cleanup_interval
        );
        loop {
            tokio::time::sleep(Duration::from_secs_f64(self.config.cleanup_interval)).await;

            let expired: Vec<String> = {
                let messages = self.messages.lock().await;
                messages
                    .values()
                    .filter(|m| m.is_expired())
                    .map(|m| m.id.clone())
                    .collect()
            };
            if expired.is_empty() {
                continue;
            }

            let mut messages = self.messages.lock().await;
            let mut seen = self.seen.lock().await;
            for id in &expired {
                messages.remove(id);
                seen.remove(id);
            }
            info!("Cleaned up {} expired gossip messages", expired.len());
        }
    }

    // ===== Certificates =====

    /// STORE our certificate PEM under `cert:<self>` on the k closest
    /// nodes so peers can seal payloads for us.
    pub async fn publish_certificate(&self) -> usize {
        let key = format!("cert:{}", self.node_id);
        let stored = self
            .dht
            .store_on_closest(&self.node_id, &key, &self.cert_pem)
            .await;
        if stored == 0 {
            warn!("No DHT nodes accepted our certificate");
        } else {
            info!("Published certificate to {} DHT nodes", stored);
        }
        stored
    }

    /// Recipient public key: cache, then peer-cache metadata, then DHT.
    async fn peer_public_key(&self, node_id: &NodeId) -> Option<RsaPublicKey> {
        if let Some(key) = self.peer_keys.lock().await.get(node_id).cloned() {
            return Some(key);
        }

        let cert_pem = match self.cached_certificate(node_id).await {
            Some(pem) => Some(pem),
            None => {
                debug!(
                    "Certificate for {} not cached, querying DHT",
                    node_id.short()
                );
                self.dht
                    .lookup_value(node_id, &format!("cert:{}", node_id))
                    .await
            }
        }?;

        match public_key_from_cert_pem(&cert_pem) {
            Ok(key) => {
                self.peer_keys
                    .lock()
                    .await
                    .insert(node_id.clone(), key.clone());
                Some(key)
            }
            Err(e) => {
                warn!("Unusable certificate for {}: {}", node_id.short(), e);
                None
            }
        }
    }

    async fn cached_certificate(&self, node_id: &NodeId) -> Option<String> {
        let p2p = self.p2p.get()?;
        p2p.cached_certificate(node_id).await
    }
}
