//! DHT-coordinated UDP hole punching.
//!
//! No STUN/TURN servers: reflexive addresses come from DHT peers echoing
//! the source address they observe, NAT type is inferred from two such
//! observations, and both sides send a PUNCH datagram at a synchronized
//! instant to open matching NAT mappings. A punched socket is upgraded to
//! DTLS by the caller.

use crate::config::PunchConfig;
use crate::dht::{now_secs, DhtManager, NatType};
use crate::identity::NodeId;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Payload both sides fire at the synchronized instant.
const PUNCH_PAYLOAD: &[u8] = b"PUNCH";

/// Delay between deciding to punch and the synchronized send.
const SYNC_DELAY_SECS: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum PunchError {
    #[error("hole punch manager not running")]
    NotRunning,

    #[error("not enough DHT peers for endpoint discovery ({have} < {need})")]
    NotEnoughPeers { have: usize, need: usize },

    #[error("no responses from endpoint discovery")]
    DiscoveryFailed,

    #[error("hole punch timeout - no response from peer")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A discovered reflexive endpoint with the inferred NAT classification.
#[derive(Debug, Clone)]
pub struct ExternalEndpoint {
    pub ip: String,
    pub port: u16,
    /// Agreement ratio across discovery responses, 0.0-1.0.
    pub confidence: f64,
    pub nat_type: NatType,
    pub discovered_at: f64,
}

#[derive(Debug, Clone)]
pub struct PunchStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub local_port: u16,
    pub discovered: Option<(String, u16, NatType)>,
}

/// Classify NAT from two reflexive port observations of the same socket.
pub fn classify_nat(port_a: u16, port_b: u16, local_port: u16) -> NatType {
    if port_a == port_b {
        if port_a == local_port {
            NatType::None
        } else {
            NatType::Cone
        }
    } else {
        NatType::Symmetric
    }
}

pub struct HolePunchManager {
    dht: Arc<DhtManager>,
    config: PunchConfig,
    socket: Arc<UdpSocket>,
    local_port: u16,
    discovered: Mutex<Option<ExternalEndpoint>>,
    /// Live while no punch/DTLS session owns the socket.
    responder: Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU64,
    successes: AtomicU64,
}

impl HolePunchManager {
    /// Bind the punch socket (reuse-address) and start the responder loop.
    pub async fn start(dht: Arc<DhtManager>, config: PunchConfig) -> Result<Arc<Self>, PunchError> {
        let socket = bind_reuse(config.port).await?;
        let local_port = socket.local_addr()?.port();
        info!("HolePunchManager started on UDP port {}", local_port);

        let manager = Arc::new(Self {
            dht,
            config,
            socket: Arc::new(socket),
            local_port,
            discovered: Mutex::new(None),
            responder: Mutex::new(None),
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
        });
        manager.spawn_responder().await;
        Ok(manager)
    }

    pub async fn stop(&self) {
        if let Some(task) = self.responder.lock().await.take() {
            task.abort();
        }
        info!("HolePunchManager stopped");
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn dtls_enabled(&self) -> bool {
        self.config.dtls_enabled
    }

    pub fn dtls_handshake_timeout(&self) -> f64 {
        self.config.dtls_handshake_timeout
    }

    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.successes.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    pub async fn stats(&self) -> PunchStatsSnapshot {
        PunchStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            local_port: self.local_port,
            discovered: self
                .discovered
                .lock()
                .await
                .as_ref()
                .map(|e| (e.ip.clone(), e.port, e.nat_type)),
        }
    }

    /// Answer PUNCH probes and forward reflexive replies into the RPC
    /// correlation map while the socket is idle.
    async fn spawn_responder(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((len, addr)) = manager.socket.recv_from(&mut buf).await else {
                    break;
                };
                let data = &buf[..len];

                if data == PUNCH_PAYLOAD {
                    debug!("Answering PUNCH probe from {}", addr);
                    let _ = manager.socket.send_to(PUNCH_PAYLOAD, addr).await;
                    continue;
                }
                if let Ok(value) = serde_json::from_slice::<Value>(data) {
                    manager.dht.rpc().resolve_external(value).await;
                }
            }
        });
        *self.responder.lock().await = Some(task);
    }

    async fn pause_responder(&self) {
        if let Some(task) = self.responder.lock().await.take() {
            task.abort();
        }
    }

    // ===== Reflexive discovery =====

    /// Discover our external `(ip, port)` by querying random DHT peers
    /// through the punch socket. The modal answer wins; confidence is the
    /// weaker of the ip and port agreement ratios.
    pub async fn discover_external_endpoint(
        &self,
        force_refresh: bool,
    ) -> Result<ExternalEndpoint, PunchError> {
        if !force_refresh {
            if let Some(cached) = self.discovered.lock().await.clone() {
                if now_secs() - cached.discovered_at < self.config.endpoint_cache_secs {
                    debug!("Using cached external endpoint");
                    return Ok(cached);
                }
            }
        }

        info!("Discovering external endpoint via DHT peers");
        let mut peers = self.dht.known_peers().await;
        if peers.len() < self.config.discovery_peers {
            return Err(PunchError::NotEnoughPeers {
                have: peers.len(),
                need: self.config.discovery_peers,
            });
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.discovery_peers);

        let mut responses: Vec<(String, u16)> = Vec::new();
        for peer in &peers {
            match self
                .dht
                .rpc()
                .discover_endpoint_via(&self.socket, &peer.ip, peer.port, 5.0)
                .await
            {
                Some((ip, port)) => {
                    debug!(
                        "Peer {} reports reflexive address {}:{}",
                        peer.node_id.short(),
                        ip,
                        port
                    );
                    responses.push((ip, port));
                }
                None => debug!("Endpoint discovery timeout from {}", peer.node_id.short()),
            }
        }

        if responses.is_empty() {
            warn!("No responses from endpoint discovery");
            return Err(PunchError::DiscoveryFailed);
        }

        let (ip, ip_votes) = modal(responses.iter().map(|(ip, _)| ip.clone()));
        let (port, port_votes) = modal(responses.iter().map(|(_, port)| *port));
        let confidence =
            (ip_votes.min(port_votes)) as f64 / responses.len() as f64;

        // Two sequential observations classify the NAT
        let nat_type = if responses.len() >= 2 {
            classify_nat(responses[0].1, responses[1].1, self.local_port)
        } else {
            NatType::Unknown
        };

        info!(
            "Discovered external endpoint {}:{} (confidence={:.0}%, nat={})",
            ip,
            port,
            confidence * 100.0,
            nat_type.as_str()
        );

        let endpoint = ExternalEndpoint {
            ip,
            port,
            confidence,
            nat_type,
            discovered_at: now_secs(),
        };
        *self.discovered.lock().await = Some(endpoint.clone());
        Ok(endpoint)
    }

    // ===== Coordinated punch =====

    /// Punch toward `peer_endpoint`: store the coordination record, sleep
    /// to the synchronized instant, fire PUNCH, and wait for the peer's
    /// PUNCH whose source IP matches. On success the still-bound socket is
    /// returned connected to the peer, ready for the DTLS upgrade; the
    /// responder loop stays paused until `resume()` is called.
    pub async fn punch_hole(
        self: &Arc<Self>,
        peer_node_id: &NodeId,
        peer_endpoint: (String, u16),
        local_endpoint: (String, u16),
    ) -> Result<Arc<UdpSocket>, PunchError> {
        info!(
            "Attempting hole punch to {} at {}:{}",
            peer_node_id.short(),
            peer_endpoint.0,
            peer_endpoint.1
        );
        self.attempts.fetch_add(1, Ordering::Relaxed);

        // Both sides derive the same instant independently
        let sync_time = now_secs() + SYNC_DELAY_SECS;

        let coordination_key = format!("punch:{}:{}", peer_node_id, self.dht.node_id());
        let coordination = json!({
            "sync_time": sync_time,
            "local_endpoint": format!("{}:{}", local_endpoint.0, local_endpoint.1),
            "peer_endpoint": format!("{}:{}", peer_endpoint.0, peer_endpoint.1),
            "timestamp": now_secs(),
        });
        let stored = self
            .dht
            .store_on_closest(peer_node_id, &coordination_key, &coordination.to_string())
            .await;
        if stored == 0 {
            debug!("Could not store punch coordination record (continuing anyway)");
        }

        let wait = sync_time - now_secs();
        if wait > 0.0 {
            debug!("Waiting {:.2}s until punch sync time", wait);
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }

        self.pause_responder().await;

        let result = self.exchange_punch(&peer_endpoint).await;
        match result {
            Ok(addr) => {
                info!("Hole punch successful, peer answered from {}", addr);
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.socket.connect(addr).await?;
                Ok(Arc::clone(&self.socket))
            }
            Err(e) => {
                // Give the socket back to the responder for future rounds
                self.spawn_responder().await;
                Err(e)
            }
        }
    }

    async fn exchange_punch(&self, peer_endpoint: &(String, u16)) -> Result<SocketAddr, PunchError> {
        let target = (peer_endpoint.0.as_str(), peer_endpoint.1);
        self.socket.send_to(PUNCH_PAYLOAD, target).await?;
        info!("Sent punch packet to {}:{}", peer_endpoint.0, peer_endpoint.1);

        let deadline = Duration::from_secs_f64(self.config.punch_timeout);
        let wait = async {
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, addr) = self.socket.recv_from(&mut buf).await?;
                if &buf[..len] != PUNCH_PAYLOAD {
                    debug!("Ignoring non-punch datagram from {}", addr);
                    continue;
                }
                if addr.ip().to_string() != peer_endpoint.0 {
                    warn!("PUNCH from unexpected source {}", addr);
                    continue;
                }
                // Answer so the peer's own wait converges even if our
                // first packet was eaten by its NAT
                let _ = self.socket.send_to(PUNCH_PAYLOAD, addr).await;
                return Ok::<SocketAddr, PunchError>(addr);
            }
        };

        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| PunchError::Timeout)?
    }

    /// Hand the socket back to the responder after a DTLS session ends.
    pub async fn resume(self: &Arc<Self>) {
        self.pause_responder().await;
        self.spawn_responder().await;
    }
}

/// Most frequent element and its vote count.
fn modal<T: Eq + std::hash::Hash + Clone>(items: impl Iterator<Item = T>) -> (T, usize) {
    let mut counts: std::collections::HashMap<T, usize> = std::collections::HashMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .expect("modal() requires at least one item")
}

/// Bind the punch socket with SO_REUSEADDR so a restart can reclaim the
/// port while old mappings drain.
async fn bind_reuse(port: u16) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_nat() {
        // Both observations equal the local binding: no NAT
        assert_eq!(classify_nat(8890, 8890, 8890), NatType::None);
        // Stable external port that differs from local: cone
        assert_eq!(classify_nat(40001, 40001, 8890), NatType::Cone);
        // Port changes per destination: symmetric
        assert_eq!(classify_nat(40001, 40002, 8890), NatType::Symmetric);
    }

    #[test]
    fn test_modal_vote() {
        let (ip, votes) = modal(
            ["1.1.1.1", "2.2.2.2", "1.1.1.1"]
                .iter()
                .map(|s| s.to_string()),
        );
        assert_eq!(ip, "1.1.1.1");
        assert_eq!(votes, 2);
    }

    #[tokio::test]
    async fn test_punch_exchange_over_loopback() {
        // A plain socket plays the remote peer: it waits for our PUNCH
        // and answers with one.
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote.local_addr().unwrap().port();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, addr) = remote.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], PUNCH_PAYLOAD);
            remote.send_to(PUNCH_PAYLOAD, addr).await.unwrap();
        });

        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        local
            .send_to(PUNCH_PAYLOAD, ("127.0.0.1", remote_port))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, addr) =
            tokio::time::timeout(Duration::from_secs(2), local.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(&buf[..len], PUNCH_PAYLOAD);
        assert_eq!(addr.port(), remote_port);
        echo.await.unwrap();
    }
}
