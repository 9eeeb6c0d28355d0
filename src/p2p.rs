//! P2P manager: the dual-stack TLS listener, outbound direct connections,
//! the unified registry of active peer connections, the peer-cache hot
//! path, WebRTC signaling integration, auto-reconnect, and shutdown.

use crate::config::Config;
use crate::dht::{DhtManager, Ipv4Info, NatType, PeerEndpoint, PunchInfo, RelayInfo};
use crate::hub::{HubClient, Signal};
use crate::identity::{NodeId, NodeIdentity};
use crate::peer_cache::{PeerCache, PeerUpdate};
use crate::punch::HolePunchManager;
use crate::router::MessageRouter;
use crate::strategy::orchestrator::ConnectionOrchestrator;
use crate::transport::webrtc::{new_peer_connection, WebRtcPeerConnection, DATA_CHANNEL_LABEL};
use crate::transport::{
    client_config, server_config, ConnectionError, PeerConnection, TlsPeerConnection, Transport,
};
use rustls::pki_types::ServerName;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, error, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("pre-flight check failed for {addr}: connection timed out - probable NAT or firewall (no port forwarding, or peer offline)")]
    PreflightTimeout { addr: String },

    #[error("pre-flight check failed for {addr}: connection actively refused - peer not listening or port blocked")]
    PreflightRefused { addr: String },

    #[error("pre-flight check failed for {addr}: {reason}")]
    Preflight { addr: String, reason: String },

    #[error("TLS connect to {addr} failed: {reason}")]
    Tls { addr: String, reason: String },

    #[error("peer did not acknowledge HELLO")]
    HelloRejected,

    #[error("connection attempt timed out")]
    Timeout,

    #[error("hub not connected")]
    HubUnavailable,

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("no connection to peer {0}")]
    NotConnected(String),

    #[error("all connection strategies failed: {0}")]
    Orchestrator(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A WebRTC connection still negotiating; moved to the active registry
/// once the data channel opens.
struct PendingWebRtc {
    pc: Arc<RTCPeerConnection>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    opened_tx: Mutex<Option<oneshot::Sender<()>>>,
}

pub struct P2pManager {
    node_id: NodeId,
    cert_pem: String,
    key_pem: String,
    config: Config,
    display_name: Mutex<Option<String>>,

    dht: Arc<DhtManager>,
    router: Arc<MessageRouter>,
    peer_cache: Mutex<PeerCache>,
    orchestrator: OnceLock<Arc<ConnectionOrchestrator>>,
    hub: OnceLock<Arc<dyn HubClient>>,
    punch: OnceLock<Arc<HolePunchManager>>,

    peers: Mutex<HashMap<NodeId, Arc<dyn PeerConnection>>>,
    pending_webrtc: Mutex<HashMap<NodeId, Arc<PendingWebRtc>>>,
    listener_tasks: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    server_tasks: Mutex<Vec<JoinHandle<()>>>,
    intentional_disconnects: Mutex<HashSet<NodeId>>,
    shutting_down: AtomicBool,

    tls_acceptor: TlsAcceptor,
    tls_connector: TlsConnector,
    advertised_ip: Mutex<String>,
    listen_port: Mutex<u16>,
}

impl P2pManager {
    pub fn new(
        identity: &NodeIdentity,
        config: Config,
        dht: Arc<DhtManager>,
        router: Arc<MessageRouter>,
        peer_cache: PeerCache,
    ) -> std::io::Result<Arc<Self>> {
        let server = server_config(&identity.cert_pem, &identity.key_pem)?;
        let client = client_config();

        Ok(Arc::new(Self {
            node_id: identity.node_id.clone(),
            cert_pem: identity.cert_pem.clone(),
            key_pem: identity.key_pem.clone(),
            display_name: Mutex::new(config.display_name.clone()),
            config,
            dht,
            router,
            peer_cache: Mutex::new(peer_cache),
            orchestrator: OnceLock::new(),
            hub: OnceLock::new(),
            punch: OnceLock::new(),
            peers: Mutex::new(HashMap::new()),
            pending_webrtc: Mutex::new(HashMap::new()),
            listener_tasks: Mutex::new(HashMap::new()),
            server_tasks: Mutex::new(Vec::new()),
            intentional_disconnects: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
            tls_acceptor: TlsAcceptor::from(server),
            tls_connector: TlsConnector::from(client),
            advertised_ip: Mutex::new("127.0.0.1".to_string()),
            listen_port: Mutex::new(0),
        }))
    }

    // ===== Wiring =====

    pub fn set_orchestrator(&self, orchestrator: Arc<ConnectionOrchestrator>) {
        let _ = self.orchestrator.set(orchestrator);
    }

    pub fn set_hub(&self, hub: Arc<dyn HubClient>) {
        let _ = self.hub.set(hub);
    }

    pub fn set_punch(&self, punch: Arc<HolePunchManager>) {
        let _ = self.punch.set(punch);
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn identity_pems(&self) -> (&str, &str) {
        (&self.cert_pem, &self.key_pem)
    }

    pub async fn set_display_name(&self, name: String) {
        *self.display_name.lock().await = Some(name);
    }

    pub fn hub_connected(&self) -> bool {
        self.hub.get().map(|h| h.is_connected()).unwrap_or(false)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
            .try_lock()
            .map(|p| *p)
            .unwrap_or(self.config.p2p.listen_port)
    }

    pub async fn advertised_ip(&self) -> String {
        self.advertised_ip.lock().await.clone()
    }

    pub async fn set_advertised_ip(&self, ip: String) {
        *self.advertised_ip.lock().await = ip.clone();
        self.dht.set_advertise_ip(ip).await;
        self.refresh_announce_value().await;
    }

    // ===== Listener =====

    /// Bind the TLS listener(s) per the configured mode and start
    /// accepting.
    pub async fn start_server(self: &Arc<Self>) -> std::io::Result<()> {
        use crate::config::ListenMode;

        let port = self.config.p2p.listen_port;
        let mut bound_port = port;
        let mut tasks = Vec::new();

        let binds: Vec<&str> = match self.config.p2p.listen_mode {
            ListenMode::Ipv4 => vec!["0.0.0.0"],
            ListenMode::Ipv6 => vec!["::"],
            ListenMode::Dual => vec!["0.0.0.0", "::"],
        };

        for host in binds {
            let bind_port = if host == "0.0.0.0" { port } else { bound_port };
            let listener = bind_listener(host, bind_port)?;
            bound_port = listener.local_addr()?.port();
            info!("Direct TLS server started on {}:{}", host, bound_port);

            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                manager.handle_incoming(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            break;
                        }
                    }
                }
            }));
        }

        *self.listen_port.lock().await = bound_port;
        self.server_tasks.lock().await.extend(tasks);
        self.refresh_announce_value().await;
        Ok(())
    }

    async fn handle_incoming(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let tls = match self.tls_acceptor.accept(stream).await {
            Ok(tls) => TlsStream::Server(tls),
            Err(e) => {
                debug!("TLS accept from {} failed: {}", addr, e);
                return;
            }
        };

        // First frame must be HELLO carrying the peer's identity
        let temp_id = self.node_id.clone(); // placeholder until HELLO arrives
        let connection = TlsPeerConnection::new(temp_id, tls);

        let hello = match connection.read().await {
            Ok(Some(frame)) => frame,
            _ => {
                debug!("Connection from {} closed before HELLO", addr);
                return;
            }
        };
        if hello.get("command").and_then(Value::as_str) != Some("HELLO") {
            warn!("First frame from {} was not HELLO", addr);
            connection.close().await;
            return;
        }
        let Some(peer_id) = hello
            .get("payload")
            .and_then(|p| p.get("node_id"))
            .and_then(Value::as_str)
            .and_then(|s| NodeId::parse(s).ok())
        else {
            warn!("HELLO from {} carried no valid node_id", addr);
            connection.close().await;
            return;
        };
        let peer_name = hello
            .get("payload")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let ack = json!({
            "command": "HELLO_ACK",
            "payload": {
                "status": "OK",
                "name": self.display_name.lock().await.clone(),
            }
        });
        if connection.send(&ack).await.is_err() {
            return;
        }

        // Re-key the connection under the real peer id
        let transport = connection.transport();
        let connection = Arc::new(connection.with_node_id(peer_id.clone()));
        let strategy = match transport {
            Transport::DirectTlsV6 => "ipv6_direct",
            _ => "ipv4_direct",
        };
        connection.set_strategy_used(strategy);

        info!(
            "Incoming direct connection from {} ({})",
            peer_id.short(),
            addr
        );

        self.update_peer_cache(
            &peer_id,
            PeerUpdate {
                display_name: peer_name,
                direct_ip: Some(addr.ip().to_string()),
                direct_port: Some(crate::peer_cache::DEFAULT_DIRECT_PORT),
                supports_direct: Some(true),
                ..Default::default()
            },
        )
        .await;

        self.register_connection(peer_id, connection).await;
        self.spawn_announce();
    }

    // ===== Outbound direct =====

    /// Plain-TCP probe before any TLS. Distinguishes "refused" from
    /// "timeout" so the caller sees a useful diagnosis instead of a TLS
    /// error.
    pub async fn test_port_connectivity(
        &self,
        host: &str,
        port: u16,
        timeout: f64,
    ) -> Result<(), P2pError> {
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(
            Duration::from_secs_f64(timeout),
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(P2pError::PreflightRefused { addr })
            }
            Ok(Err(e)) => Err(P2pError::Preflight {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(P2pError::PreflightTimeout { addr }),
        }
    }

    /// Direct TLS connect with HELLO identity exchange, registered in the
    /// active map with a listener task.
    pub async fn connect_directly(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        target: &NodeId,
        timeout: Option<f64>,
    ) -> Result<Arc<dyn PeerConnection>, P2pError> {
        let connection = self.dial_and_hello(host, port, target, timeout).await?;
        let connection: Arc<dyn PeerConnection> = connection;

        self.update_peer_cache(
            target,
            PeerUpdate {
                direct_ip: Some(host.to_string()),
                direct_port: Some(port),
                supports_direct: Some(true),
                ..Default::default()
            },
        )
        .await;

        self.register_connection(target.clone(), Arc::clone(&connection))
            .await;
        self.spawn_announce();

        // Auto-discover the peer's capabilities
        let providers = json!({"command": "GET_PROVIDERS", "payload": {}});
        if let Err(e) = connection.send(&providers).await {
            debug!("Failed to request providers from {}: {}", target.short(), e);
        }

        Ok(connection)
    }

    /// TCP + TLS + HELLO without touching the registry (relay client and
    /// the hot path build on this).
    pub async fn open_direct_connection(
        &self,
        host: &str,
        port: u16,
        target: &NodeId,
    ) -> Result<Arc<dyn PeerConnection>, P2pError> {
        let connection = self.dial_and_hello(host, port, target, None).await?;
        Ok(connection)
    }

    async fn dial_and_hello(
        &self,
        host: &str,
        port: u16,
        target: &NodeId,
        timeout: Option<f64>,
    ) -> Result<Arc<TlsPeerConnection>, P2pError> {
        let timeout = timeout.unwrap_or(self.config.p2p.connection_timeout);
        let addr = format!("{host}:{port}");
        info!("Initiating direct connection to {} at {}", target.short(), addr);

        let preflight = self.config.p2p.preflight_timeout.min(timeout);
        self.test_port_connectivity(host, port, preflight).await?;
        debug!("Pre-flight check passed for {}", addr);

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| P2pError::Tls {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let tls = tokio::time::timeout(Duration::from_secs_f64(timeout), async {
            let tcp = TcpStream::connect((host, port)).await?;
            self.tls_connector.connect(server_name, tcp).await
        })
        .await
        .map_err(|_| P2pError::Timeout)?
        .map_err(|e| P2pError::Tls {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let connection = TlsPeerConnection::new(target.clone(), TlsStream::Client(tls));

        let hello = json!({
            "command": "HELLO",
            "payload": {
                "node_id": self.node_id,
                "name": self.display_name.lock().await.clone(),
            }
        });
        connection
            .send(&hello)
            .await
            .map_err(|_| P2pError::HelloRejected)?;

        let ack = connection
            .read()
            .await
            .ok()
            .flatten()
            .ok_or(P2pError::HelloRejected)?;
        let status = ack
            .get("payload")
            .and_then(|p| p.get("status"))
            .and_then(Value::as_str);
        if ack.get("command").and_then(Value::as_str) != Some("HELLO_ACK") || status != Some("OK") {
            connection.close().await;
            return Err(P2pError::HelloRejected);
        }

        if let Some(name) = ack
            .get("payload")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        {
            info!("Peer name: {}", name);
            self.update_peer_cache(
                target,
                PeerUpdate {
                    display_name: Some(name.to_string()),
                    ..Default::default()
                },
            )
            .await;
        }

        // Outgoing connections also carry the strategy their socket
        // family implies
        let strategy = match connection.transport() {
            Transport::DirectTlsV6 => "ipv6_direct",
            _ => "ipv4_direct",
        };
        connection.set_strategy_used(strategy);

        info!("Direct connection established with {}", target.short());
        Ok(Arc::new(connection))
    }

    // ===== High-level connect =====

    /// Connect by node id: existing connection, then the peer-cache hot
    /// path, then the full orchestrator.
    pub async fn connect_via_node_id(
        self: &Arc<Self>,
        target: &NodeId,
    ) -> Result<Arc<dyn PeerConnection>, P2pError> {
        if let Some(existing) = self.peers.lock().await.get(target).cloned() {
            debug!("Already connected to {}", target.short());
            return Ok(existing);
        }

        // Hot path: recently seen peer with a cached direct address
        let cached = {
            let cache = self.peer_cache.lock().await;
            cache.get(target).and_then(|p| {
                if p.is_recently_seen(self.config.p2p.cache_recency_hours) {
                    p.last_direct_ip
                        .clone()
                        .map(|ip| (ip, p.last_direct_port))
                } else {
                    None
                }
            })
        };
        if let Some((ip, port)) = cached {
            debug!(
                "Peer-cache hot path for {}: trying {}:{}",
                target.short(),
                ip,
                port
            );
            match self
                .connect_directly(&ip, port, target, Some(self.config.p2p.cache_attempt_timeout))
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) => debug!("Hot path failed for {}: {}", target.short(), e),
            }
        }

        let orchestrator = self
            .orchestrator
            .get()
            .ok_or_else(|| P2pError::Orchestrator("orchestrator not wired".into()))?;
        orchestrator
            .connect(target, None)
            .await
            .map_err(|e| P2pError::Orchestrator(e.to_string()))
    }

    // ===== Registry =====

    /// Insert into the active map and start the per-peer listener task.
    ///
    /// Written as a manually-boxed future (rather than `async fn`) because
    /// this function participates in a recursive call cycle through
    /// `tokio::spawn` (register_connection -> listen_to_peer ->
    /// handle_connection_lost -> connect_via_node_id -> connect_directly ->
    /// register_connection); leaving it as an opaque `impl Future` makes
    /// rustc's Send auto-trait inference cyclic across that chain.
    pub fn register_connection(
        self: &Arc<Self>,
        peer_id: NodeId,
        connection: Arc<dyn PeerConnection>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let previous = self
                .peers
                .lock()
                .await
                .insert(peer_id.clone(), Arc::clone(&connection));
            if let Some(previous) = previous {
                debug!("Replacing existing connection to {}", peer_id.short());
                previous.close().await;
            }

            let manager = Arc::clone(self);
            let task_peer = peer_id.clone();
            let task = tokio::spawn(async move {
                manager.listen_to_peer(task_peer, connection).await;
            });
            if let Some(old) = self.listener_tasks.lock().await.insert(peer_id, task) {
                old.abort();
            }
        })
    }

    /// Registry entry without a listener task. Used for the virtual
    /// gossip connection, whose inbound path is the gossip manager.
    pub async fn register_virtual_connection(
        &self,
        peer_id: NodeId,
        connection: Arc<dyn PeerConnection>,
    ) {
        self.peers.lock().await.insert(peer_id, connection);
    }

    async fn listen_to_peer(self: Arc<Self>, peer_id: NodeId, connection: Arc<dyn PeerConnection>) {
        let transport = connection.transport();
        loop {
            match connection.read().await {
                Ok(Some(message)) => {
                    // Gossip virtual connections poll with a bounded wait;
                    // their None means "nothing yet", but for stream
                    // transports None is a closure. Gossip conns are never
                    // registered with listener tasks, so None is closure
                    // here.
                    let manager = Arc::clone(&self);
                    let sender = peer_id.clone();
                    tokio::spawn(async move {
                        manager.router.route(sender, &message).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Read error from {}: {}", peer_id.short(), e);
                    break;
                }
            }
        }

        self.listener_tasks.lock().await.remove(&peer_id);
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let was_active = self.peers.lock().await.remove(&peer_id).is_some();
        if was_active {
            info!("Connection with peer {} was lost", peer_id.short());
            self.handle_connection_lost(peer_id, transport).await;
        }
    }

    /// Auto-reconnect policy: one attempt after a fixed delay, unless the
    /// drop was intentional. A lost WebRTC channel is only retried while
    /// the hub is still there to signal through.
    async fn handle_connection_lost(self: &Arc<Self>, peer_id: NodeId, transport: Transport) {
        if self.intentional_disconnects.lock().await.remove(&peer_id) {
            debug!(
                "Intentional disconnect from {}, skipping reconnect",
                peer_id.short()
            );
            return;
        }
        if transport == Transport::HubWebrtc && !self.hub_connected() {
            debug!(
                "WebRTC loss for {} with hub offline, skipping reconnect",
                peer_id.short()
            );
            return;
        }

        let delay = self.config.p2p.reconnect_delay;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            if manager.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            info!("Auto-reconnecting to {}", peer_id.short());
            if let Err(e) = manager.connect_via_node_id(&peer_id).await {
                warn!("Auto-reconnect to {} failed: {}", peer_id.short(), e);
            }
        });
    }

    pub async fn send_to_peer(
        &self,
        peer_id: &NodeId,
        message: &Value,
    ) -> Result<(), ConnectionError> {
        let connection = self.peers.lock().await.get(peer_id).cloned();
        match connection {
            Some(connection) => connection.send(message).await,
            None => Err(ConnectionError::SendFailed(format!(
                "peer {} not connected",
                peer_id.short()
            ))),
        }
    }

    pub async fn connected_peer_ids(&self) -> Vec<NodeId> {
        self.peers.lock().await.keys().cloned().collect()
    }

    pub async fn connection_to(&self, peer_id: &NodeId) -> Option<Arc<dyn PeerConnection>> {
        self.peers.lock().await.get(peer_id).cloned()
    }

    pub async fn is_connected(&self, peer_id: &NodeId) -> bool {
        self.peers.lock().await.contains_key(peer_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    // ===== Peer cache =====

    pub async fn update_peer_cache(&self, peer_id: &NodeId, update: PeerUpdate) {
        self.peer_cache.lock().await.add_or_update(peer_id, update);
    }

    pub async fn cached_peer(&self, peer_id: &NodeId) -> Option<crate::peer_cache::CachedPeer> {
        self.peer_cache.lock().await.get(peer_id).cloned()
    }

    pub async fn cached_certificate(&self, peer_id: &NodeId) -> Option<String> {
        let cache = self.peer_cache.lock().await;
        cache
            .get(peer_id)?
            .metadata
            .get("certificate")?
            .as_str()
            .map(str::to_string)
    }

    // ===== DHT announce =====

    fn spawn_announce(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.dht.announce().await;
        });
    }

    /// Build the v2.0 endpoint record we advertise.
    pub async fn build_endpoint_record(&self) -> PeerEndpoint {
        let ip = self.advertised_ip().await;
        let port = self.listen_port();

        let mut endpoint = PeerEndpoint::new(
            self.node_id.clone(),
            Ipv4Info {
                local: format!("{ip}:{port}"),
                external: None,
                nat_type: None,
            },
        );

        if let Some(punch) = self.punch.get() {
            let external = punch.discover_external_endpoint(false).await.ok();
            if let Some(external) = external {
                endpoint.ipv4.external = Some(format!("{}:{}", external.ip, external.port));
                endpoint.ipv4.nat_type = Some(external.nat_type);
                endpoint.punch = Some(PunchInfo {
                    supported: true,
                    stun_port: Some(punch.local_port()),
                    success_rate: punch.success_rate() as f32,
                });
            } else if self.config.hole_punch.enabled {
                endpoint.ipv4.nat_type = Some(NatType::Unknown);
                endpoint.punch = Some(PunchInfo {
                    supported: true,
                    stun_port: Some(punch.local_port()),
                    success_rate: punch.success_rate() as f32,
                });
            }
        }

        if self.config.relay.enabled && self.config.relay.volunteer {
            endpoint.relay = Some(RelayInfo {
                available: true,
                max_peers: self.config.relay.max_peers as u32,
                region: self.config.relay.region.clone(),
                uptime: 1.0,
            });
        }

        endpoint
    }

    /// Upgrade the DHT announce value from the legacy contact string to
    /// the serialized v2.0 record.
    pub async fn refresh_announce_value(&self) {
        let endpoint = self.build_endpoint_record().await;
        self.dht.set_announce_value(endpoint.to_json()).await;
    }

    // ===== WebRTC =====

    /// Initiator side: offer via the hub, wait for the data channel.
    /// Exposed unconditionally; callers gate on `hub_connected()`.
    pub async fn connect_via_webrtc(
        self: &Arc<Self>,
        target: &NodeId,
    ) -> Result<Arc<dyn PeerConnection>, P2pError> {
        let hub = self.hub.get().ok_or(P2pError::HubUnavailable)?;
        if !hub.is_connected() {
            return Err(P2pError::HubUnavailable);
        }

        info!("Starting WebRTC connection to {}", target.short());
        let pc = new_peer_connection(&self.config.webrtc)
            .await
            .map_err(|e| P2pError::WebRtc(e.to_string()))?;

        let channel = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| P2pError::WebRtc(e.to_string()))?;

        let (opened_tx, opened_rx) = oneshot::channel();
        let pending = Arc::new(PendingWebRtc {
            pc: Arc::clone(&pc),
            channel: Mutex::new(Some(Arc::clone(&channel))),
            opened_tx: Mutex::new(Some(opened_tx)),
        });
        self.pending_webrtc
            .lock()
            .await
            .insert(target.clone(), Arc::clone(&pending));

        {
            let pending = Arc::clone(&pending);
            channel.on_open(Box::new(move || {
                let pending = Arc::clone(&pending);
                Box::pin(async move {
                    if let Some(tx) = pending.opened_tx.lock().await.take() {
                        let _ = tx.send(());
                    }
                })
            }));
        }
        self.forward_ice_candidates(&pc, target).await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| P2pError::WebRtc(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| P2pError::WebRtc(e.to_string()))?;
        hub.send_signal(Signal::offer(self.node_id.clone(), target.clone(), offer.sdp))
            .await
            .map_err(|e| P2pError::WebRtc(e.to_string()))?;

        // Answer and ICE arrive via handle_incoming_signal; wait for the
        // channel to open
        let opened = tokio::time::timeout(
            Duration::from_secs_f64(self.config.webrtc.open_timeout),
            opened_rx,
        )
        .await;
        match opened {
            Ok(Ok(())) => self.finalize_webrtc(target).await,
            _ => {
                // Abandon the negotiation so a later attempt starts clean
                if let Some(pending) = self.pending_webrtc.lock().await.remove(target) {
                    let _ = pending.pc.close().await;
                }
                Err(P2pError::WebRtc("data channel open timeout".into()))
            }
        }
    }

    /// Inbound signaling from the hub client.
    pub async fn handle_incoming_signal(self: &Arc<Self>, signal: Signal) {
        match signal.kind.as_str() {
            "webrtc_offer" => self.handle_webrtc_offer(signal).await,
            "webrtc_answer" => self.handle_webrtc_answer(signal).await,
            "ice_candidate" => self.handle_ice_candidate(signal).await,
            other => warn!("Unknown signal type '{}' from hub", other),
        }
    }

    async fn handle_webrtc_offer(self: &Arc<Self>, signal: Signal) {
        let from = signal.from_node.clone();
        let Some(sdp) = signal.payload.get("sdp").and_then(Value::as_str) else {
            warn!("webrtc_offer without sdp from {}", from.short());
            return;
        };
        let Some(hub) = self.hub.get() else { return };

        info!("Handling WebRTC offer from {}", from.short());
        let pc = match new_peer_connection(&self.config.webrtc).await {
            Ok(pc) => pc,
            Err(e) => {
                warn!("Failed to build peer connection: {}", e);
                return;
            }
        };

        let (opened_tx, _opened_rx) = oneshot::channel();
        let pending = Arc::new(PendingWebRtc {
            pc: Arc::clone(&pc),
            channel: Mutex::new(None),
            opened_tx: Mutex::new(Some(opened_tx)),
        });
        self.pending_webrtc
            .lock()
            .await
            .insert(from.clone(), Arc::clone(&pending));

        // The answerer receives the channel the initiator created
        {
            let manager = Arc::clone(self);
            let pending = Arc::clone(&pending);
            let from = from.clone();
            pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let manager = Arc::clone(&manager);
                let pending = Arc::clone(&pending);
                let from = from.clone();
                Box::pin(async move {
                    *pending.channel.lock().await = Some(Arc::clone(&channel));
                    let manager_open = Arc::clone(&manager);
                    let from_open = from.clone();
                    channel.on_open(Box::new(move || {
                        let manager = manager_open;
                        let from = from_open;
                        Box::pin(async move {
                            if let Err(e) = manager.finalize_webrtc(&from).await {
                                warn!("WebRTC finalize for {} failed: {}", from.short(), e);
                            }
                        })
                    }));
                })
            }));
        }
        self.forward_ice_candidates(&pc, &from).await;

        let remote = match RTCSessionDescription::offer(sdp.to_string()) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Invalid offer sdp: {}", e);
                return;
            }
        };
        if let Err(e) = pc.set_remote_description(remote).await {
            warn!("set_remote_description failed: {}", e);
            return;
        }
        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("create_answer failed: {}", e);
                return;
            }
        };
        if let Err(e) = pc.set_local_description(answer.clone()).await {
            warn!("set_local_description failed: {}", e);
            return;
        }
        let _ = hub
            .send_signal(Signal::answer(self.node_id.clone(), from, answer.sdp))
            .await;
    }

    async fn handle_webrtc_answer(&self, signal: Signal) {
        let from = signal.from_node.clone();
        let Some(sdp) = signal.payload.get("sdp").and_then(Value::as_str) else {
            warn!("webrtc_answer without sdp from {}", from.short());
            return;
        };
        let Some(pending) = self.pending_webrtc.lock().await.get(&from).cloned() else {
            warn!("Answer from {} without pending offer", from.short());
            return;
        };

        let remote = match RTCSessionDescription::answer(sdp.to_string()) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Invalid answer sdp: {}", e);
                return;
            }
        };
        if let Err(e) = pending.pc.set_remote_description(remote).await {
            warn!("set_remote_description (answer) failed: {}", e);
        }
    }

    async fn handle_ice_candidate(&self, signal: Signal) {
        let from = signal.from_node.clone();
        let Some(pending) = self.pending_webrtc.lock().await.get(&from).cloned() else {
            debug!("ICE candidate from {} without pending connection", from.short());
            return;
        };

        match serde_json::from_value(signal.payload) {
            Ok(candidate) => {
                if let Err(e) = pending.pc.add_ice_candidate(candidate).await {
                    debug!("add_ice_candidate failed: {}", e);
                }
            }
            Err(e) => debug!("Unparseable ICE candidate from {}: {}", from.short(), e),
        }
    }

    async fn forward_ice_candidates(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, target: &NodeId) {
        let Some(hub) = self.hub.get().cloned() else { return };
        let self_id = self.node_id.clone();
        let target = target.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let hub = Arc::clone(&hub);
            let self_id = self_id.clone();
            let target = target.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let Ok(payload) = serde_json::to_value(init) else { return };
                let _ = hub
                    .send_signal(Signal::ice_candidate(self_id, target, payload))
                    .await;
            })
        }));
    }

    /// Move a pending WebRTC negotiation into the active registry.
    async fn finalize_webrtc(
        self: &Arc<Self>,
        peer_id: &NodeId,
    ) -> Result<Arc<dyn PeerConnection>, P2pError> {
        let Some(pending) = self.pending_webrtc.lock().await.remove(peer_id) else {
            // Already finalized by the other path
            return self
                .connection_to(peer_id)
                .await
                .ok_or_else(|| P2pError::NotConnected(peer_id.to_string()));
        };

        let channel = pending
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| P2pError::WebRtc("no data channel".into()))?;

        let connection = WebRtcPeerConnection::start(
            peer_id.clone(),
            Arc::clone(&pending.pc),
            channel,
            self.config.webrtc.keepalive_interval,
        );
        connection.set_strategy_used("hub_webrtc");
        let connection: Arc<dyn PeerConnection> = connection;

        self.update_peer_cache(
            peer_id,
            PeerUpdate {
                supports_webrtc: Some(true),
                ..Default::default()
            },
        )
        .await;
        self.register_connection(peer_id.clone(), Arc::clone(&connection))
            .await;

        // Exchange names and capabilities over the fresh channel
        let hello = json!({
            "command": "HELLO",
            "payload": {
                "node_id": self.node_id,
                "name": self.display_name.lock().await.clone(),
            }
        });
        let _ = connection.send(&hello).await;
        let _ = connection
            .send(&json!({"command": "GET_PROVIDERS", "payload": {}}))
            .await;

        info!("WebRTC connection with {} active", peer_id.short());
        Ok(connection)
    }

    // ===== Shutdown =====

    /// Close one peer connection without triggering auto-reconnect.
    pub async fn shutdown_peer_connection(&self, peer_id: &NodeId) {
        self.intentional_disconnects
            .lock()
            .await
            .insert(peer_id.clone());

        if let Some(task) = self.listener_tasks.lock().await.remove(peer_id) {
            task.abort();
        }
        if let Some(connection) = self.peers.lock().await.remove(peer_id) {
            connection.close().await;
            info!("Closed connection to {}", peer_id.short());
        }
    }

    /// Full teardown: server, listeners, connections, pending WebRTC, DHT.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("P2P manager shutting down");

        for task in self.server_tasks.lock().await.drain(..) {
            task.abort();
        }
        for (_, task) in self.listener_tasks.lock().await.drain() {
            task.abort();
        }

        let peers: Vec<Arc<dyn PeerConnection>> =
            self.peers.lock().await.drain().map(|(_, c)| c).collect();
        for connection in peers {
            connection.close().await;
        }

        for (_, pending) in self.pending_webrtc.lock().await.drain() {
            let _ = pending.pc.close().await;
        }

        self.intentional_disconnects.lock().await.clear();
        self.dht.stop().await;
        info!("P2P manager shutdown complete");
    }
}

/// Bind a listener for one address family. The IPv6 socket is pinned to
/// v6-only so the dual-stack mode can hold both families on one port.
fn bind_listener(host: &str, port: u16) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
    let ipv6 = ip.is_ipv6();
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if ipv6 {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::from((ip, port));
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
