//! Gossip store-and-forward strategy (priority 6): the last resort.
//!
//! Yields a virtual connection with eventual delivery; the only
//! requirement is at least one connected peer to seed the epidemic.

use super::{ConnectionStrategy, StrategyContext, StrategyError};
use crate::dht::PeerEndpoint;
use crate::identity::NodeId;
use crate::transport::{GossipPeerConnection, PeerConnection};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct GossipStoreForwardStrategy {
    timeout: f64,
}

impl GossipStoreForwardStrategy {
    pub fn new(timeout: f64) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionStrategy for GossipStoreForwardStrategy {
    fn name(&self) -> &'static str {
        "gossip_store_forward"
    }

    fn priority(&self) -> u8 {
        6
    }

    fn timeout(&self) -> f64 {
        self.timeout
    }

    fn is_applicable(&self, _endpoints: &PeerEndpoint, _ctx: &StrategyContext) -> bool {
        true
    }

    async fn connect(
        &self,
        node_id: &NodeId,
        _endpoints: &PeerEndpoint,
        ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError> {
        let gossip = ctx
            .gossip
            .as_ref()
            .ok_or_else(|| StrategyError::NotApplicable("gossip manager not running".into()))?;

        if ctx.p2p.peer_count().await == 0 {
            return Err(StrategyError::Failed(
                "no connected peers to carry gossip".into(),
            ));
        }

        info!(
            "Falling back to gossip store-and-forward for {}",
            node_id.short()
        );
        let connection = GossipPeerConnection::start(node_id.clone(), Arc::clone(gossip)).await;
        Ok(connection as Arc<dyn PeerConnection>)
    }
}
