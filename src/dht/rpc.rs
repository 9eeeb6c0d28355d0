//! UDP JSON RPC for the DHT.
//!
//! Request/response pairs: PING→PONG, FIND_NODE→NODES_FOUND,
//! STORE→STORED, FIND_VALUE→VALUE_FOUND|NODES_FOUND, and
//! DISCOVER_ENDPOINT, whose response is an untyped reflexive-address
//! echo. Every envelope carries `type`, `rpc_id`, `node_id`, `timestamp`.
//!
//! Requests retry with exponential backoff and correlate responses
//! through a pending map keyed by `rpc_id`. A per-source-IP window drops
//! abusive senders silently.

use super::routing::{now_secs, DhtNode, RoutingTable};
use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// RPC tuning knobs.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Per-attempt response wait, seconds.
    pub timeout: f64,
    pub max_retries: u32,
    pub max_packet_size: usize,
    /// Max requests per minute per source IP.
    pub rate_limit_per_ip: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: 5.0,
            max_retries: 3,
            max_packet_size: 8192,
            rate_limit_per_ip: 100,
        }
    }
}

/// Wire form of a routing-table entry inside NODES_FOUND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContact {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
}

impl From<&DhtNode> for NodeContact {
    fn from(n: &DhtNode) -> Self {
        Self {
            node_id: n.node_id.clone(),
            ip: n.ip.clone(),
            port: n.port,
        }
    }
}

/// FIND_VALUE either returns the value or the k closest nodes.
#[derive(Debug)]
pub enum FindValueResult {
    Value(String),
    Nodes(Vec<DhtNode>),
}

#[derive(Debug, Default)]
pub struct RpcStats {
    pub rpcs_sent: AtomicU64,
    pub rpcs_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
    pub rate_limited: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct RpcStatsSnapshot {
    pub rpcs_sent: u64,
    pub rpcs_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub rate_limited: u64,
}

/// UDP RPC endpoint shared by the DHT manager and the hole-punch manager.
pub struct RpcHandler {
    node_id: NodeId,
    config: RpcConfig,
    socket: Arc<UdpSocket>,
    routing: Arc<Mutex<RoutingTable>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    storage: Mutex<HashMap<String, String>>,
    rate_windows: Mutex<HashMap<IpAddr, (u32, f64)>>,
    pub stats: RpcStats,
}

impl RpcHandler {
    /// Bind the UDP socket and build the handler. `port` 0 binds an
    /// ephemeral port (tests).
    pub async fn bind(
        node_id: NodeId,
        routing: Arc<Mutex<RoutingTable>>,
        config: RpcConfig,
        host: &str,
        port: u16,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind((host, port)).await?;
        let local = socket.local_addr()?;
        info!("DHT RPC server started on {} (UDP)", local);

        Ok(Arc::new(Self {
            node_id,
            config,
            socket: Arc::new(socket),
            routing,
            pending: Mutex::new(HashMap::new()),
            storage: Mutex::new(HashMap::new()),
            rate_windows: Mutex::new(HashMap::new()),
            stats: RpcStats::default(),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the datagram receive loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match handler.socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if len > handler.config.max_packet_size {
                            warn!("Ignoring oversized datagram from {} ({} bytes)", addr, len);
                            handler.stats.errors.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        handler.handle_datagram(&buf[..len], addr).await;
                    }
                    Err(e) => {
                        error!("DHT UDP receive error: {}", e);
                        break;
                    }
                }
            }
        })
    }

    // ===== Outgoing RPCs (client side) =====

    /// PING a node; a PONG inserts the responder into the routing table.
    pub async fn ping(&self, ip: &str, port: u16) -> Option<Value> {
        let (_, rpc) = self.envelope("PING");
        let response = self.send_rpc(ip, port, rpc).await?;
        if response.get("type").and_then(Value::as_str) != Some("PONG") {
            return None;
        }

        if let Some(peer_id) = response.get("node_id").and_then(Value::as_str) {
            if let Ok(peer_id) = NodeId::parse(peer_id) {
                let mut routing = self.routing.lock().await;
                let _ = routing.add(peer_id, ip.to_string(), port);
            }
        }
        Some(response)
    }

    /// FIND_NODE: the responder's k closest nodes to `target`.
    pub async fn find_node(&self, ip: &str, port: u16, target: &NodeId) -> Option<Vec<DhtNode>> {
        let (_, mut rpc) = self.envelope("FIND_NODE");
        rpc["target_id"] = json!(target);

        let response = self.send_rpc(ip, port, rpc).await?;
        if response.get("type").and_then(Value::as_str) != Some("NODES_FOUND") {
            return None;
        }
        Some(parse_nodes(&response))
    }

    /// STORE a key→value pair on the target node.
    pub async fn store(&self, ip: &str, port: u16, key: &str, value: &str) -> bool {
        let (_, mut rpc) = self.envelope("STORE");
        rpc["key"] = json!(key);
        rpc["value"] = json!(value);

        match self.send_rpc(ip, port, rpc).await {
            Some(response) if response.get("type").and_then(Value::as_str) == Some("STORED") => {
                response
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// FIND_VALUE: the stored value, or the responder's k closest nodes.
    pub async fn find_value(&self, ip: &str, port: u16, key: &str) -> Option<FindValueResult> {
        let (_, mut rpc) = self.envelope("FIND_VALUE");
        rpc["key"] = json!(key);

        let response = self.send_rpc(ip, port, rpc).await?;
        match response.get("type").and_then(Value::as_str) {
            Some("VALUE_FOUND") => response
                .get("value")
                .and_then(Value::as_str)
                .map(|v| FindValueResult::Value(v.to_string())),
            Some("NODES_FOUND") => Some(FindValueResult::Nodes(parse_nodes(&response))),
            _ => None,
        }
    }

    /// DISCOVER_ENDPOINT: the reflexive `(ip, port)` the responder saw.
    pub async fn discover_endpoint(&self, ip: &str, port: u16) -> Option<(String, u16)> {
        let (_, rpc) = self.envelope("DISCOVER_ENDPOINT");
        let response = self.send_rpc(ip, port, rpc).await?;

        let reflexive_ip = response.get("reflexive_ip")?.as_str()?.to_string();
        let reflexive_port = response.get("reflexive_port")?.as_u64()? as u16;
        Some((reflexive_ip, reflexive_port))
    }

    /// Like `discover_endpoint`, but through a caller-supplied socket so
    /// the observation reflects that socket's NAT mapping (hole punching).
    pub async fn discover_endpoint_via(
        &self,
        socket: &UdpSocket,
        ip: &str,
        port: u16,
        timeout: f64,
    ) -> Option<(String, u16)> {
        let (rpc_id, rpc) = self.envelope("DISCOVER_ENDPOINT");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(rpc_id.clone(), tx);

        let data = rpc.to_string().into_bytes();
        if let Err(e) = socket.send_to(&data, (ip, port)).await {
            debug!("discover via punch socket failed: {}", e);
            self.pending.lock().await.remove(&rpc_id);
            return None;
        }
        self.stats.rpcs_sent.fetch_add(1, Ordering::Relaxed);

        // The reply lands on the punch socket, not ours; the hole-punch
        // manager forwards it back through resolve_external().
        match tokio::time::timeout(Duration::from_secs_f64(timeout), rx).await {
            Ok(Ok(response)) => {
                let reflexive_ip = response.get("reflexive_ip")?.as_str()?.to_string();
                let reflexive_port = response.get("reflexive_port")?.as_u64()? as u16;
                Some((reflexive_ip, reflexive_port))
            }
            _ => {
                self.pending.lock().await.remove(&rpc_id);
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Resolve a response that arrived on a foreign socket (punch port).
    pub async fn resolve_external(&self, message: Value) {
        if let Some(rpc_id) = message.get("rpc_id").and_then(Value::as_str) {
            let sender = self.pending.lock().await.remove(rpc_id);
            if let Some(tx) = sender {
                let _ = tx.send(message);
            }
        }
    }

    /// Read a locally stored value (STORE handler's state).
    pub async fn local_value(&self, key: &str) -> Option<String> {
        self.storage.lock().await.get(key).cloned()
    }

    pub fn stats_snapshot(&self) -> RpcStatsSnapshot {
        RpcStatsSnapshot {
            rpcs_sent: self.stats.rpcs_sent.load(Ordering::Relaxed),
            rpcs_received: self.stats.rpcs_received.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
        }
    }

    // ===== Incoming RPCs (server side) =====

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        if !self.check_rate_limit(addr.ip()).await {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.rpcs_received.fetch_add(1, Ordering::Relaxed);

        let message: Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                debug!("Invalid RPC JSON from {}: {}", addr, e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match message.get("type").and_then(Value::as_str) {
            Some("PING") => self.handle_ping(&message, addr).await,
            Some("FIND_NODE") => self.handle_find_node(&message, addr).await,
            Some("STORE") => self.handle_store(&message, addr).await,
            Some("FIND_VALUE") => self.handle_find_value(&message, addr).await,
            Some("DISCOVER_ENDPOINT") => self.handle_discover_endpoint(&message, addr).await,
            Some("PONG") | Some("NODES_FOUND") | Some("STORED") | Some("VALUE_FOUND") => {
                self.resolve_pending(&message).await;
            }
            Some(other) => {
                warn!("Unknown RPC type '{}' from {}", other, addr);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            // Untyped messages are reflexive-address responses
            None => self.resolve_pending(&message).await,
        }
    }

    async fn remember_sender(&self, message: &Value, addr: SocketAddr) {
        let Some(sender_id) = message.get("node_id").and_then(Value::as_str) else {
            return;
        };
        let Ok(sender_id) = NodeId::parse(sender_id) else {
            debug!("Ignoring RPC sender with malformed node id from {}", addr);
            return;
        };
        if sender_id == self.node_id {
            info!("Ignoring RPC carrying our own node id from {}", addr);
            return;
        }
        let mut routing = self.routing.lock().await;
        let _ = routing.add(sender_id, addr.ip().to_string(), addr.port());
    }

    async fn handle_ping(&self, message: &Value, addr: SocketAddr) {
        self.remember_sender(message, addr).await;

        let response = json!({
            "type": "PONG",
            "rpc_id": message.get("rpc_id").cloned().unwrap_or(Value::Null),
            "node_id": self.node_id,
            "timestamp": now_secs(),
        });
        self.send_datagram(addr, &response).await;
    }

    async fn handle_find_node(&self, message: &Value, addr: SocketAddr) {
        self.remember_sender(message, addr).await;

        let Some(target) = message.get("target_id").and_then(Value::as_str) else {
            warn!("FIND_NODE missing target_id from {}", addr);
            return;
        };
        let Ok(target) = NodeId::parse(target) else {
            warn!("FIND_NODE with malformed target_id from {}", addr);
            return;
        };

        let (k, closest) = {
            let routing = self.routing.lock().await;
            (routing.k(), routing.find_closest(&target, routing.k()))
        };
        let nodes: Vec<NodeContact> = closest.iter().take(k).map(NodeContact::from).collect();

        let response = json!({
            "type": "NODES_FOUND",
            "rpc_id": message.get("rpc_id").cloned().unwrap_or(Value::Null),
            "node_id": self.node_id,
            "nodes": nodes,
            "timestamp": now_secs(),
        });
        self.send_datagram(addr, &response).await;
    }

    async fn handle_store(&self, message: &Value, addr: SocketAddr) {
        self.remember_sender(message, addr).await;

        let key = message.get("key").and_then(Value::as_str);
        let value = message.get("value").and_then(Value::as_str);
        let (Some(key), Some(value)) = (key, value) else {
            warn!("STORE missing key/value from {}", addr);
            return;
        };

        self.storage
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        debug!("Stored {} ({} bytes)", key, value.len());

        let response = json!({
            "type": "STORED",
            "rpc_id": message.get("rpc_id").cloned().unwrap_or(Value::Null),
            "node_id": self.node_id,
            "success": true,
            "timestamp": now_secs(),
        });
        self.send_datagram(addr, &response).await;
    }

    async fn handle_find_value(&self, message: &Value, addr: SocketAddr) {
        self.remember_sender(message, addr).await;

        let Some(key) = message.get("key").and_then(Value::as_str) else {
            warn!("FIND_VALUE missing key from {}", addr);
            return;
        };

        let stored = self.storage.lock().await.get(key).cloned();
        let response = match stored {
            Some(value) => json!({
                "type": "VALUE_FOUND",
                "rpc_id": message.get("rpc_id").cloned().unwrap_or(Value::Null),
                "node_id": self.node_id,
                "value": value,
                "timestamp": now_secs(),
            }),
            None => {
                // Keys that parse as node ids sort against the table;
                // prefixed keys ("relay:", "cert:") get arbitrary closest.
                let target = NodeId::parse(key).unwrap_or_else(|_| NodeId::from_value(0));
                let (k, closest) = {
                    let routing = self.routing.lock().await;
                    (routing.k(), routing.find_closest(&target, routing.k()))
                };
                let nodes: Vec<NodeContact> =
                    closest.iter().take(k).map(NodeContact::from).collect();
                json!({
                    "type": "NODES_FOUND",
                    "rpc_id": message.get("rpc_id").cloned().unwrap_or(Value::Null),
                    "node_id": self.node_id,
                    "nodes": nodes,
                    "timestamp": now_secs(),
                })
            }
        };
        self.send_datagram(addr, &response).await;
    }

    async fn handle_discover_endpoint(&self, message: &Value, addr: SocketAddr) {
        self.remember_sender(message, addr).await;

        let response = json!({
            "rpc_id": message.get("rpc_id").cloned().unwrap_or(Value::Null),
            "node_id": self.node_id,
            "reflexive_ip": addr.ip().to_string(),
            "reflexive_port": addr.port(),
            "timestamp": now_secs(),
        });
        self.send_datagram(addr, &response).await;
    }

    async fn resolve_pending(&self, message: &Value) {
        let Some(rpc_id) = message.get("rpc_id").and_then(Value::as_str) else {
            debug!("Response without rpc_id dropped");
            return;
        };
        let sender = self.pending.lock().await.remove(rpc_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(message.clone());
            }
            None => debug!("Response with unknown rpc_id {} dropped", rpc_id),
        }
    }

    // ===== Internals =====

    fn envelope(&self, rpc_type: &str) -> (String, Value) {
        let rpc_id = Uuid::new_v4().to_string();
        let rpc = json!({
            "type": rpc_type,
            "rpc_id": rpc_id,
            "node_id": self.node_id,
            "timestamp": now_secs(),
        });
        (rpc_id, rpc)
    }

    async fn send_rpc(&self, ip: &str, port: u16, rpc: Value) -> Option<Value> {
        let rpc_id = rpc.get("rpc_id")?.as_str()?.to_string();
        let rpc_type = rpc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();

        for attempt in 0..self.config.max_retries {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(rpc_id.clone(), tx);

            self.send_datagram_to(ip, port, &rpc).await;
            self.stats.rpcs_sent.fetch_add(1, Ordering::Relaxed);

            match tokio::time::timeout(Duration::from_secs_f64(self.config.timeout), rx).await {
                Ok(Ok(response)) => {
                    debug!(
                        "RPC {} succeeded (attempt {}/{})",
                        rpc_type,
                        attempt + 1,
                        self.config.max_retries
                    );
                    return Some(response);
                }
                _ => {
                    self.pending.lock().await.remove(&rpc_id);
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "RPC {} timeout (attempt {}/{})",
                        rpc_type,
                        attempt + 1,
                        self.config.max_retries
                    );
                    if attempt + 1 < self.config.max_retries {
                        let backoff = 0.1 * 2f64.powi(attempt as i32);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }

        debug!(
            "RPC {} to {}:{} failed after {} attempts",
            rpc_type, ip, port, self.config.max_retries
        );
        None
    }

    async fn send_datagram(&self, addr: SocketAddr, message: &Value) {
        let mut data = message.to_string().into_bytes();
        if data.len() > self.config.max_packet_size {
            warn!(
                "Outgoing datagram too large ({} bytes), truncating",
                data.len()
            );
            data.truncate(self.config.max_packet_size);
        }
        if let Err(e) = self.socket.send_to(&data, addr).await {
            debug!("Failed to send datagram to {}: {}", addr, e);
        }
    }

    async fn send_datagram_to(&self, ip: &str, port: u16, message: &Value) {
        match format!("{ip}:{port}").parse::<SocketAddr>() {
            Ok(addr) => self.send_datagram(addr, message).await,
            Err(_) => {
                // Hostname seeds resolve through the OS
                let mut data = message.to_string().into_bytes();
                if data.len() > self.config.max_packet_size {
                    data.truncate(self.config.max_packet_size);
                }
                if let Err(e) = self.socket.send_to(&data, (ip, port)).await {
                    debug!("Failed to send datagram to {}:{}: {}", ip, port, e);
                }
            }
        }
    }

    /// Sliding one-minute window per source IP; excess is dropped.
    async fn check_rate_limit(&self, ip: IpAddr) -> bool {
        let now = now_secs();
        let mut windows = self.rate_windows.lock().await;

        match windows.get_mut(&ip) {
            Some((count, reset_at)) if now < *reset_at => {
                if *count >= self.config.rate_limit_per_ip {
                    return false;
                }
                *count += 1;
            }
            _ => {
                windows.insert(ip, (1, now + 60.0));
            }
        }
        true
    }
}

fn parse_nodes(response: &Value) -> Vec<DhtNode> {
    response
        .get("nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| {
                    let contact: NodeContact = serde_json::from_value(n.clone()).ok()?;
                    Some(DhtNode::new(contact.node_id, contact.ip, contact.port))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_parts(v: u128) -> (NodeId, Arc<Mutex<RoutingTable>>) {
        let id = NodeId::from_value(v);
        let routing = Arc::new(Mutex::new(RoutingTable::new(id.clone(), 20, 2, 900.0)));
        (id, routing)
    }

    async fn spawn_handler(v: u128) -> (Arc<RpcHandler>, SocketAddr, JoinHandle<()>) {
        let (id, routing) = handler_parts(v);
        let handler = RpcHandler::bind(id, routing, RpcConfig::default(), "127.0.0.1", 0)
            .await
            .unwrap();
        let addr = handler.local_addr().unwrap();
        let task = handler.start();
        (handler, addr, task)
    }

    #[tokio::test]
    async fn test_ping_pong_populates_both_tables() {
        let (a, _addr_a, task_a) = spawn_handler(1).await;
        let (b, addr_b, task_b) = spawn_handler(2).await;

        let pong = a.ping("127.0.0.1", addr_b.port()).await;
        assert!(pong.is_some());
        assert_eq!(
            pong.unwrap().get("node_id").unwrap().as_str().unwrap(),
            NodeId::from_value(2).to_string()
        );

        // Caller learned the responder, responder learned the caller
        assert_eq!(a.routing.lock().await.node_count(), 1);
        assert_eq!(b.routing.lock().await.node_count(), 1);

        task_a.abort();
        task_b.abort();
    }

    #[tokio::test]
    async fn test_store_and_find_value() {
        let (a, _addr_a, task_a) = spawn_handler(1).await;
        let (_b, addr_b, task_b) = spawn_handler(2).await;

        assert!(a.store("127.0.0.1", addr_b.port(), "greeting", "hello").await);

        match a.find_value("127.0.0.1", addr_b.port(), "greeting").await {
            Some(FindValueResult::Value(v)) => assert_eq!(v, "hello"),
            other => panic!("expected value, got {other:?}"),
        }

        // A miss returns nodes instead
        match a.find_value("127.0.0.1", addr_b.port(), "missing").await {
            Some(FindValueResult::Nodes(_)) => {}
            other => panic!("expected nodes, got {other:?}"),
        }

        task_a.abort();
        task_b.abort();
    }

    #[tokio::test]
    async fn test_find_node_returns_known_peers() {
        let (a, _addr_a, task_a) = spawn_handler(1).await;
        let (b, addr_b, task_b) = spawn_handler(2).await;

        {
            let mut routing = b.routing.lock().await;
            routing
                .add(NodeId::from_value(7), "10.0.0.7".into(), 8889)
                .unwrap();
        }

        let nodes = a
            .find_node("127.0.0.1", addr_b.port(), &NodeId::from_value(7))
            .await
            .unwrap();
        assert!(nodes.iter().any(|n| n.node_id == NodeId::from_value(7)));

        task_a.abort();
        task_b.abort();
    }

    #[tokio::test]
    async fn test_discover_endpoint_echoes_source() {
        let (a, addr_a, task_a) = spawn_handler(1).await;
        let (_b, addr_b, task_b) = spawn_handler(2).await;

        let (ip, port) = a.discover_endpoint("127.0.0.1", addr_b.port()).await.unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(port, addr_a.port());

        task_a.abort();
        task_b.abort();
    }

    #[tokio::test]
    async fn test_timeout_when_peer_silent() {
        let (_id, routing) = handler_parts(1);
        let config = RpcConfig {
            timeout: 0.2,
            max_retries: 2,
            ..Default::default()
        };
        let a = RpcHandler::bind(NodeId::from_value(1), routing, config, "127.0.0.1", 0)
            .await
            .unwrap();
        let task = a.start();

        // Nothing listens on this socket's far end
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let start = std::time::Instant::now();
        assert!(a.ping("127.0.0.1", dead_port).await.is_none());
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(a.stats_snapshot().timeouts >= 2);

        task.abort();
    }

    #[tokio::test]
    async fn test_unmatched_response_dropped() {
        let (a, addr_a, task_a) = spawn_handler(1).await;

        let rogue = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake = json!({
            "type": "PONG",
            "rpc_id": "never-issued",
            "node_id": NodeId::from_value(9),
            "timestamp": now_secs(),
        });
        rogue
            .send_to(fake.to_string().as_bytes(), addr_a)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Nothing resolved, nothing inserted
        assert_eq!(a.routing.lock().await.node_count(), 0);
        assert!(a.pending.lock().await.is_empty());

        task_a.abort();
    }

    #[tokio::test]
    async fn test_rate_limit_drops_excess() {
        let (_id, routing) = handler_parts(1);
        let config = RpcConfig {
            rate_limit_per_ip: 3,
            ..Default::default()
        };
        let a = RpcHandler::bind(NodeId::from_value(1), routing, config, "127.0.0.1", 0)
            .await
            .unwrap();
        let addr_a = a.local_addr().unwrap();
        let task = a.start();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..10 {
            let ping = json!({
                "type": "PING",
                "rpc_id": Uuid::new_v4().to_string(),
                "node_id": NodeId::from_value(5),
                "timestamp": now_secs(),
            });
            sender
                .send_to(ping.to_string().as_bytes(), addr_a)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a.stats_snapshot().rate_limited >= 7);

        task.abort();
    }
}
