//! Node configuration with every protocol default in one place.
//!
//! All timeouts, ports, and capacity limits used by the connection core are
//! settable here. `Config::default()` is the documented baseline; binaries
//! may load overrides from a JSON file and CLI flags.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default TCP port for the direct-TLS listener.
pub const DEFAULT_P2P_PORT: u16 = 8888;

/// Default UDP port for DHT RPCs (TLS port + 1).
pub const DEFAULT_DHT_PORT: u16 = 8889;

/// Default UDP port for hole punching (DHT port + 1).
pub const DEFAULT_PUNCH_PORT: u16 = 8890;

/// Listener mode for the direct-TLS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Bind `0.0.0.0` only.
    Ipv4,
    /// Bind `::` only.
    Ipv6,
    /// Bind both families.
    Dual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory holding node.key, node.crt and the peer cache.
    pub data_dir: PathBuf,
    /// Display name sent in HELLO exchanges.
    pub display_name: Option<String>,

    pub p2p: P2pConfig,
    pub dht: DhtConfig,
    pub hole_punch: PunchConfig,
    pub relay: RelayConfig,
    pub gossip: GossipConfig,
    pub strategies: StrategyConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub listen_port: u16,
    pub listen_mode: ListenMode,
    /// Outer bound for a direct TLS connect, seconds.
    pub connection_timeout: f64,
    /// Plain-TCP pre-flight probe bound, seconds.
    pub preflight_timeout: f64,
    /// Peer-cache hot-path attempt bound, seconds.
    pub cache_attempt_timeout: f64,
    /// "Recently seen" window for the peer-cache hot path, hours.
    pub cache_recency_hours: i64,
    /// Delay before an automatic reconnect attempt, seconds.
    pub reconnect_delay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,
    pub port: u16,
    /// Kademlia bucket size.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    /// Max records per /24 subnet per bucket.
    pub subnet_diversity_limit: usize,
    /// Seed nodes, `host:port`.
    pub seed_nodes: Vec<String>,

    pub bootstrap_timeout: f64,
    pub lookup_timeout: f64,
    pub bucket_refresh_interval: f64,
    pub announce_interval: f64,

    pub rpc_timeout: f64,
    pub rpc_retries: u32,
    pub max_packet_size: usize,
    /// Max RPCs per minute per source IP.
    pub rate_limit_per_ip: u32,
    /// Record staleness threshold, seconds.
    pub node_stale_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PunchConfig {
    pub enabled: bool,
    pub port: u16,
    /// DHT peers queried per reflexive discovery round.
    pub discovery_peers: usize,
    /// Wait for the peer's PUNCH reply, seconds.
    pub punch_timeout: f64,
    /// Reflexive-endpoint cache freshness, seconds.
    pub endpoint_cache_secs: f64,
    pub dtls_enabled: bool,
    pub dtls_handshake_timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Accept relay sessions for other peers.
    pub volunteer: bool,
    /// Max concurrent sessions when volunteering.
    pub max_peers: usize,
    pub bandwidth_limit_mbps: f64,
    pub region: String,
    pub prefer_region: Option<String>,
    /// Relay discovery cache lifetime, seconds.
    pub cache_timeout: f64,
    /// Per-sender forwarded messages per second.
    pub message_rate_limit: u32,
    /// Pending registration lifetime, seconds.
    pub register_timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub enabled: bool,
    pub fanout: usize,
    pub max_hops: u32,
    pub ttl_seconds: u64,
    pub sync_interval: f64,
    pub cleanup_interval: f64,
    pub default_priority: String,
}

/// Per-strategy enable flags and timeouts (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub ipv6_direct: StrategyEntry,
    pub ipv4_direct: StrategyEntry,
    pub hub_webrtc: StrategyEntry,
    pub udp_hole_punch: StrategyEntry,
    pub volunteer_relay: StrategyEntry,
    pub gossip_store_forward: StrategyEntry,
    /// Overall orchestrator deadline, seconds.
    pub overall_timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyEntry {
    pub enabled: bool,
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Data-channel open bound, seconds.
    pub open_timeout: f64,
    /// Data-channel keepalive period, seconds.
    pub keepalive_interval: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl TurnServer {
    /// Credentials fall back to `MESHCORE_TURN_USERNAME` /
    /// `MESHCORE_TURN_CREDENTIAL` when not set inline.
    pub fn resolved_credentials(&self) -> (Option<String>, Option<String>) {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var("MESHCORE_TURN_USERNAME").ok());
        let credential = self
            .credential
            .clone()
            .or_else(|| std::env::var("MESHCORE_TURN_CREDENTIAL").ok());
        (username, credential)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            display_name: None,
            p2p: P2pConfig::default(),
            dht: DhtConfig::default(),
            hole_punch: PunchConfig::default(),
            relay: RelayConfig::default(),
            gossip: GossipConfig::default(),
            strategies: StrategyConfig::default(),
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_P2P_PORT,
            listen_mode: ListenMode::Dual,
            connection_timeout: 30.0,
            preflight_timeout: 30.0,
            cache_attempt_timeout: 5.0,
            cache_recency_hours: 168,
            reconnect_delay: 3.0,
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_DHT_PORT,
            k: 20,
            alpha: 3,
            subnet_diversity_limit: 2,
            seed_nodes: Vec::new(),
            bootstrap_timeout: 30.0,
            lookup_timeout: 10.0,
            bucket_refresh_interval: 3600.0,
            announce_interval: 3600.0,
            rpc_timeout: 5.0,
            rpc_retries: 3,
            max_packet_size: 8192,
            rate_limit_per_ip: 100,
            node_stale_secs: 900.0,
        }
    }
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PUNCH_PORT,
            discovery_peers: 3,
            punch_timeout: 10.0,
            endpoint_cache_secs: 300.0,
            dtls_enabled: true,
            dtls_handshake_timeout: 3.0,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volunteer: false,
            max_peers: 10,
            bandwidth_limit_mbps: 10.0,
            region: "global".to_string(),
            prefer_region: None,
            cache_timeout: 300.0,
            message_rate_limit: 100,
            register_timeout: 30.0,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fanout: 3,
            max_hops: 5,
            ttl_seconds: 86_400,
            sync_interval: 300.0,
            cleanup_interval: 300.0,
            default_priority: "normal".to_string(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ipv6_direct: StrategyEntry { enabled: true, timeout: 10.0 },
            ipv4_direct: StrategyEntry { enabled: true, timeout: 10.0 },
            hub_webrtc: StrategyEntry { enabled: true, timeout: 30.0 },
            udp_hole_punch: StrategyEntry { enabled: true, timeout: 15.0 },
            volunteer_relay: StrategyEntry { enabled: true, timeout: 20.0 },
            gossip_store_forward: StrategyEntry { enabled: true, timeout: 5.0 },
            overall_timeout: 30.0,
        }
    }
}

impl Default for StrategyEntry {
    fn default() -> Self {
        Self { enabled: true, timeout: 10.0 }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            open_timeout: 30.0,
            keepalive_interval: 20.0,
        }
    }
}

impl Config {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Parsed seed node list, skipping malformed entries.
    pub fn seed_addrs(&self) -> Vec<(String, u16)> {
        self.dht
            .seed_nodes
            .iter()
            .filter_map(|s| {
                let (host, port) = s.rsplit_once(':')?;
                Some((host.to_string(), port.parse().ok()?))
            })
            .collect()
    }
}
