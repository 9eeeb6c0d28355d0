//! Direct TLS strategies: IPv6 (priority 1) and IPv4 (priority 2).

use super::{ConnectionStrategy, StrategyContext, StrategyError};
use crate::dht::{split_host_port, PeerEndpoint};
use crate::identity::NodeId;
use crate::transport::PeerConnection;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Direct TLS over a global IPv6 address. No NAT in the way, so this is
/// the cheapest and most direct path.
pub struct Ipv6DirectStrategy {
    timeout: f64,
}

impl Ipv6DirectStrategy {
    pub fn new(timeout: f64) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionStrategy for Ipv6DirectStrategy {
    fn name(&self) -> &'static str {
        "ipv6_direct"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn timeout(&self) -> f64 {
        self.timeout
    }

    fn is_applicable(&self, endpoints: &PeerEndpoint, _ctx: &StrategyContext) -> bool {
        endpoints.has_ipv6()
    }

    async fn connect(
        &self,
        node_id: &NodeId,
        endpoints: &PeerEndpoint,
        ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError> {
        let ipv6 = endpoints
            .ipv6
            .as_ref()
            .ok_or_else(|| StrategyError::NotApplicable("peer has no IPv6 endpoint".into()))?;
        let (host, port) = split_host_port(&ipv6.address)
            .map_err(|e| StrategyError::Failed(e.to_string()))?;

        info!("Trying IPv6 direct to {} at [{}]:{}", node_id.short(), host, port);
        ctx.p2p
            .connect_directly(&host, port, node_id, Some(self.timeout))
            .await
            .map_err(|e| StrategyError::Failed(e.to_string()))
    }
}

/// Direct TLS over IPv4: the advertised external address first (port
/// forwarding), then the local one (same LAN).
pub struct Ipv4DirectStrategy {
    timeout: f64,
}

impl Ipv4DirectStrategy {
    pub fn new(timeout: f64) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionStrategy for Ipv4DirectStrategy {
    fn name(&self) -> &'static str {
        "ipv4_direct"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn timeout(&self) -> f64 {
        self.timeout
    }

    fn is_applicable(&self, endpoints: &PeerEndpoint, _ctx: &StrategyContext) -> bool {
        !endpoints.ipv4.local.is_empty()
    }

    async fn connect(
        &self,
        node_id: &NodeId,
        endpoints: &PeerEndpoint,
        ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError> {
        let mut last_error = String::from("no IPv4 address usable");

        let mut candidates = Vec::new();
        if let Some(external) = endpoints.external_ipv4_address() {
            candidates.push(external);
        }
        if let Ok(local) = endpoints.primary_ipv4_address() {
            candidates.push(local);
        }

        for (host, port) in candidates {
            info!("Trying IPv4 direct to {} at {}:{}", node_id.short(), host, port);
            match ctx
                .p2p
                .connect_directly(&host, port, node_id, Some(self.timeout))
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!("IPv4 direct to {}:{} failed: {}", host, port, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(StrategyError::Failed(last_error))
    }
}
