//! The uniform peer-connection abstraction and its concrete transports.
//!
//! Every transport exposes the same `send`/`read`/`close` surface; higher
//! layers never see raw sockets or TLS state.

pub mod dtls;
pub mod framing;
pub mod gossip;
pub mod relayed;
pub mod tls;
pub mod webrtc;

use crate::identity::NodeId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

// Re-exports
pub use dtls::{upgrade_to_dtls, DtlsError, DtlsPeerConnection};
pub use framing::{decode_frame, encode_frame, read_frame, write_frame, HEADER_LEN};
pub use gossip::GossipPeerConnection;
pub use relayed::RelayedPeerConnection;
pub use tls::{client_config, server_config, TlsPeerConnection};
pub use webrtc::WebRtcPeerConnection;

/// Which transport carries a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    DirectTlsV4,
    DirectTlsV6,
    HubWebrtc,
    UdpDtls,
    Relayed,
    Gossip,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::DirectTlsV4 => "direct_tls_v4",
            Transport::DirectTlsV6 => "direct_tls_v6",
            Transport::HubWebrtc => "hub_webrtc",
            Transport::UdpDtls => "udp_dtls",
            Transport::Relayed => "relayed",
            Transport::Gossip => "gossip",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("connection not running")]
    NotRunning,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Uniform interface over direct TLS, DTLS/UDP, WebRTC, relayed, and
/// virtual gossip connections.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn node_id(&self) -> &NodeId;
    fn transport(&self) -> Transport;

    /// Name of the strategy that produced this connection, once known.
    fn strategy_used(&self) -> Option<String>;
    fn set_strategy_used(&self, strategy: &str);

    async fn send(&self, message: &Value) -> Result<(), ConnectionError>;

    /// Next inbound message; `None` when the connection ended (or, for the
    /// gossip transport, when the bounded wait elapsed).
    async fn read(&self) -> Result<Option<Value>, ConnectionError>;

    async fn close(&self);
}

/// Interior-mutable slot for the winning strategy name, shared by every
/// transport implementation.
#[derive(Debug, Default)]
pub struct StrategySlot(Mutex<Option<String>>);

impl StrategySlot {
    pub fn get(&self) -> Option<String> {
        self.0.lock().ok().and_then(|g| g.clone())
    }

    pub fn set(&self, strategy: &str) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = Some(strategy.to_string());
        }
    }
}
