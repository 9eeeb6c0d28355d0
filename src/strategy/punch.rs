//! UDP hole-punch strategy (priority 4): DHT-coordinated punching with a
//! DTLS upgrade, no STUN/TURN servers.

use super::{ConnectionStrategy, StrategyContext, StrategyError};
use crate::dht::{NatType, PeerEndpoint};
use crate::identity::NodeId;
use crate::transport::{upgrade_to_dtls, PeerConnection};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct UdpHolePunchStrategy {
    timeout: f64,
}

impl UdpHolePunchStrategy {
    pub fn new(timeout: f64) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionStrategy for UdpHolePunchStrategy {
    fn name(&self) -> &'static str {
        "udp_hole_punch"
    }

    fn priority(&self) -> u8 {
        4
    }

    fn timeout(&self) -> f64 {
        self.timeout
    }

    /// Applicable when the peer advertises punch support and is not
    /// behind a symmetric NAT (unknown is worth an attempt).
    fn is_applicable(&self, endpoints: &PeerEndpoint, ctx: &StrategyContext) -> bool {
        let dtls_ready = ctx.punch.as_ref().map(|p| p.dtls_enabled()).unwrap_or(false);
        if !dtls_ready || !endpoints.supports_hole_punching() {
            return false;
        }
        endpoints
            .ipv4
            .nat_type
            .map(|nat| nat.is_punchable())
            .unwrap_or(true)
    }

    async fn connect(
        &self,
        node_id: &NodeId,
        endpoints: &PeerEndpoint,
        ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError> {
        let punch = ctx
            .punch
            .as_ref()
            .ok_or_else(|| StrategyError::NotApplicable("hole punch manager not running".into()))?;

        // Our side of the NAT question
        let local = punch
            .discover_external_endpoint(false)
            .await
            .map_err(|e| StrategyError::Failed(format!("endpoint discovery failed: {e}")))?;
        if local.nat_type == NatType::Symmetric {
            return Err(StrategyError::NotApplicable(
                "local symmetric NAT defeats hole punching".into(),
            ));
        }
        info!(
            "Local endpoint {}:{} (nat={}, confidence {:.0}%)",
            local.ip,
            local.port,
            local.nat_type.as_str(),
            local.confidence * 100.0
        );

        // Peer's punch address: external host + advertised punch port
        let (peer_host, external_port) = endpoints
            .external_ipv4_address()
            .ok_or_else(|| StrategyError::Failed("peer has not announced an external endpoint".into()))?;
        let peer_port = endpoints
            .punch
            .as_ref()
            .and_then(|p| p.stun_port)
            .unwrap_or(external_port);

        let socket = punch
            .punch_hole(
                node_id,
                (peer_host.clone(), peer_port),
                (local.ip.clone(), local.port),
            )
            .await
            .map_err(|e| StrategyError::Failed(e.to_string()))?;

        info!("UDP hole punch to {} succeeded, upgrading to DTLS", node_id.short());

        let (cert_pem, key_pem) = ctx.p2p.identity_pems();
        let handshake_timeout = punch.dtls_handshake_timeout();
        match upgrade_to_dtls(socket, cert_pem, key_pem, node_id, true, handshake_timeout).await {
            Ok(connection) => Ok(Arc::new(connection)),
            Err(e) => {
                warn!(
                    "DTLS handshake failed after successful punch to {}: {}",
                    node_id.short(),
                    e
                );
                // Identity mismatch or handshake failure invalidates the
                // punched mapping; release the socket back to the manager
                punch.resume().await;
                Err(StrategyError::Failed(format!("DTLS upgrade failed: {e}")))
            }
        }
    }
}
