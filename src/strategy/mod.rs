//! Connection strategies: six pluggable ways to reach a peer, tried in
//! priority order by the orchestrator.
//!
//! Priority reflects directness, cost, and reach: global IPv6 beats NAT'd
//! IPv4 beats signaled WebRTC beats decentralized punching beats relaying
//! beats eventual gossip delivery.

pub mod direct;
pub mod gossip;
pub mod orchestrator;
pub mod punch;
pub mod relay;
pub mod webrtc;

use crate::dht::{DhtManager, PeerEndpoint};
use crate::gossip::GossipManager;
use crate::identity::NodeId;
use crate::p2p::P2pManager;
use crate::punch::HolePunchManager;
use crate::relay::RelayManager;
use crate::transport::PeerConnection;
use async_trait::async_trait;
use std::sync::Arc;

pub use direct::{Ipv4DirectStrategy, Ipv6DirectStrategy};
pub use gossip::GossipStoreForwardStrategy;
pub use orchestrator::{ConnectionOrchestrator, OrchestratorError, OrchestratorStats};
pub use punch::UdpHolePunchStrategy;
pub use relay::VolunteerRelayStrategy;
pub use webrtc::HubWebRtcStrategy;

/// How a strategy attempt ended when it did not yield a connection.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// Skipped silently by the orchestrator; never surfaced to callers.
    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("connection failed: {0}")]
    Failed(String),

    #[error("attempt timed out")]
    Timeout,
}

/// Managers a strategy may need. Optional members stay `None` when the
/// corresponding subsystem is disabled.
#[derive(Clone)]
pub struct StrategyContext {
    pub p2p: Arc<P2pManager>,
    pub dht: Arc<DhtManager>,
    pub punch: Option<Arc<HolePunchManager>>,
    pub relay: Option<Arc<RelayManager>>,
    pub gossip: Option<Arc<GossipManager>>,
}

/// One way of connecting to a peer.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 1 is tried first, 6 last.
    fn priority(&self) -> u8;

    /// Per-attempt budget, seconds. The orchestrator clamps it to the
    /// remaining overall deadline.
    fn timeout(&self) -> f64;

    /// Cheap predicate over the peer's endpoint record and local state.
    fn is_applicable(&self, endpoints: &PeerEndpoint, ctx: &StrategyContext) -> bool;

    async fn connect(
        &self,
        node_id: &NodeId,
        endpoints: &PeerEndpoint,
        ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError>;
}

/// The standard strategy set, honoring per-strategy enable flags and
/// timeouts from the configuration.
pub fn default_strategies(
    config: &crate::config::StrategyConfig,
) -> Vec<Arc<dyn ConnectionStrategy>> {
    let mut strategies: Vec<Arc<dyn ConnectionStrategy>> = Vec::new();

    if config.ipv6_direct.enabled {
        strategies.push(Arc::new(Ipv6DirectStrategy::new(config.ipv6_direct.timeout)));
    }
    if config.ipv4_direct.enabled {
        strategies.push(Arc::new(Ipv4DirectStrategy::new(config.ipv4_direct.timeout)));
    }
    if config.hub_webrtc.enabled {
        strategies.push(Arc::new(HubWebRtcStrategy::new(config.hub_webrtc.timeout)));
    }
    if config.udp_hole_punch.enabled {
        strategies.push(Arc::new(UdpHolePunchStrategy::new(
            config.udp_hole_punch.timeout,
        )));
    }
    if config.volunteer_relay.enabled {
        strategies.push(Arc::new(VolunteerRelayStrategy::new(
            config.volunteer_relay.timeout,
        )));
    }
    if config.gossip_store_forward.enabled {
        strategies.push(Arc::new(GossipStoreForwardStrategy::new(
            config.gossip_store_forward.timeout,
        )));
    }

    strategies.sort_by_key(|s| s.priority());
    strategies
}
