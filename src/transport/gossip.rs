//! Virtual peer connection over the gossip tier.
//!
//! No socket exists; sends become epidemic gossip messages and reads wait
//! on the delivery queue the gossip manager feeds. Delivery is eventual,
//! not real-time.

use super::{ConnectionError, PeerConnection, StrategySlot, Transport};
use crate::gossip::GossipManager;
use crate::identity::NodeId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Upper bound on a single `read` wait. Gossip is not real-time; callers
/// poll rather than block forever.
const READ_WAIT_SECS: u64 = 30;

pub struct GossipPeerConnection {
    peer_id: NodeId,
    gossip: Arc<GossipManager>,
    inbound: Mutex<mpsc::Receiver<Value>>,
    running: AtomicBool,
    strategy: StrategySlot,
}

impl GossipPeerConnection {
    /// Register with the gossip manager for deliveries from `peer_id`.
    pub async fn start(peer_id: NodeId, gossip: Arc<GossipManager>) -> Arc<Self> {
        let inbound = gossip.register_delivery(&peer_id).await;
        info!(
            "GossipPeerConnection created: peer={} (virtual, eventual delivery)",
            peer_id.short()
        );
        Arc::new(Self {
            peer_id,
            gossip,
            inbound: Mutex::new(inbound),
            running: AtomicBool::new(true),
            strategy: StrategySlot::default(),
        })
    }
}

#[async_trait]
impl PeerConnection for GossipPeerConnection {
    fn node_id(&self) -> &NodeId {
        &self.peer_id
    }

    fn transport(&self) -> Transport {
        Transport::Gossip
    }

    fn strategy_used(&self) -> Option<String> {
        self.strategy.get()
    }

    fn set_strategy_used(&self, strategy: &str) {
        self.strategy.set(strategy);
    }

    async fn send(&self, message: &Value) -> Result<(), ConnectionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotRunning);
        }
        self.gossip
            .send_gossip(&self.peer_id, message.clone(), None)
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Waits up to 30 s for a delivery; `None` on timeout or after close.
    async fn read(&self) -> Result<Option<Value>, ConnectionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(Duration::from_secs(READ_WAIT_SECS), inbound.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => {
                debug!("Gossip read timeout for {}", self.peer_id.short());
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.gossip.unregister_delivery(&self.peer_id).await;
        info!("GossipPeerConnection closed: peer={}", self.peer_id.short());
    }
}
