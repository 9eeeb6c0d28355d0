//! Interface to the (external) hub signaling service.
//!
//! The hub itself is not part of this crate; only the surface the
//! connection core needs is defined here: connectivity state and a way to
//! relay WebRTC signaling envelopes. An application supplies the
//! implementation and feeds inbound signals to
//! `P2pManager::handle_incoming_signal`.

use crate::identity::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub not connected")]
    NotConnected,

    #[error("signal send failed: {0}")]
    SendFailed(String),
}

/// Signaling envelope exchanged through the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// "webrtc_offer" | "webrtc_answer" | "ice_candidate"
    #[serde(rename = "type")]
    pub kind: String,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub payload: Value,
}

impl Signal {
    pub fn offer(from: NodeId, to: NodeId, sdp: String) -> Self {
        Self {
            kind: "webrtc_offer".into(),
            from_node: from,
            to_node: to,
            payload: serde_json::json!({ "sdp": sdp }),
        }
    }

    pub fn answer(from: NodeId, to: NodeId, sdp: String) -> Self {
        Self {
            kind: "webrtc_answer".into(),
            from_node: from,
            to_node: to,
            payload: serde_json::json!({ "sdp": sdp }),
        }
    }

    pub fn ice_candidate(from: NodeId, to: NodeId, candidate: Value) -> Self {
        Self {
            kind: "ice_candidate".into(),
            from_node: from,
            to_node: to,
            payload: candidate,
        }
    }
}

/// What the core needs from a hub connection.
#[async_trait]
pub trait HubClient: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn send_signal(&self, signal: Signal) -> Result<(), HubError>;
}
