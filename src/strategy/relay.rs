//! Volunteer relay strategy (priority 5): always applicable, 100% NAT
//! coverage at the cost of a third party forwarding ciphertext.

use super::{ConnectionStrategy, StrategyContext, StrategyError};
use crate::dht::PeerEndpoint;
use crate::identity::NodeId;
use crate::transport::PeerConnection;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct VolunteerRelayStrategy {
    timeout: f64,
}

impl VolunteerRelayStrategy {
    pub fn new(timeout: f64) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionStrategy for VolunteerRelayStrategy {
    fn name(&self) -> &'static str {
        "volunteer_relay"
    }

    fn priority(&self) -> u8 {
        5
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
        let relay_manager = ctx
            .relay
            .as_ref()
            .ok_or_else(|| StrategyError::NotApplicable("relay manager not running".into()))?;

        let relay = relay_manager
            .find_relay(None, false)
            .await
            .ok_or_else(|| StrategyError::Failed("no available relays found".into()))?;
        info!(
            "Trying relay {} (quality {:.2}) for {}",
            relay.node_id.short(),
            relay.quality_score(),
            node_id.short()
        );

        let connection = relay_manager
            .connect_via_relay(node_id, &relay)
            .await
            .map_err(|e| StrategyError::Failed(e.to_string()))?;
        Ok(connection as Arc<dyn PeerConnection>)
    }
}
