//! Hub-signaled WebRTC strategy (priority 3).

use super::{ConnectionStrategy, StrategyContext, StrategyError};
use crate::dht::PeerEndpoint;
use crate::identity::NodeId;
use crate::transport::PeerConnection;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// WebRTC through the hub's signaling channel. Needs the hub online; the
/// connect method itself always exists on the P2P manager.
pub struct HubWebRtcStrategy {
    timeout: f64,
}

impl HubWebRtcStrategy {
    pub fn new(timeout: f64) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionStrategy for HubWebRtcStrategy {
    fn name(&self) -> &'static str {
        "hub_webrtc"
    }

    fn priority(&self) -> u8 {
        3
    }

    fn timeout(&self) -> f64 {
        self.timeout
    }

    fn is_applicable(&self, _endpoints: &PeerEndpoint, ctx: &StrategyContext) -> bool {
        ctx.p2p.hub_connected()
    }

    async fn connect(
        &self,
        node_id: &NodeId,
        _endpoints: &PeerEndpoint,
        ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError> {
        if !ctx.p2p.hub_connected() {
            return Err(StrategyError::NotApplicable("hub not connected".into()));
        }

        info!("Trying hub WebRTC to {}", node_id.short());
        ctx.p2p
            .connect_via_webrtc(node_id)
            .await
            .map_err(|e| StrategyError::Failed(e.to_string()))
    }
}
