//! DTLS upgrade for punched UDP sockets.
//!
//! After a successful hole punch both sides wrap the still-bound socket in
//! DTLS 1.2 with mutual certificates. The peer certificate's Common Name
//! must equal the expected node ID; any other identity aborts the upgrade
//! before a connection is handed out. The underlying UDP socket is never
//! closed here, that stays with the caller.

use super::{framing, ConnectionError, PeerConnection, StrategySlot, Transport};
use crate::identity::{node_id_from_cert_der, NodeId};
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use webrtc::dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use webrtc::dtls::conn::DTLSConn;
use webrtc::dtls::crypto::{Certificate as DtlsCertificate, CryptoPrivateKey};
use webrtc::util::Conn;

#[derive(Debug, thiserror::Error)]
pub enum DtlsError {
    #[error("DTLS handshake timeout after {0:.1}s")]
    HandshakeTimeout(f64),

    #[error("DTLS handshake failed: {0}")]
    Handshake(String),

    #[error("peer presented no certificate")]
    MissingCertificate,

    #[error("peer certificate CN mismatch: expected {expected}, got {got}")]
    CertificateMismatch { expected: String, got: String },

    #[error("identity material unusable: {0}")]
    Identity(String),
}

/// Build the webrtc-dtls certificate from our PEM identity.
fn dtls_certificate(cert_pem: &str, key_pem: &str) -> Result<DtlsCertificate, DtlsError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| DtlsError::Identity(e.to_string()))?;
    if certs.is_empty() {
        return Err(DtlsError::Identity("no certificate in PEM".into()));
    }

    let key_pair =
        rcgen::KeyPair::from_pem(key_pem).map_err(|e| DtlsError::Identity(e.to_string()))?;
    let private_key = CryptoPrivateKey::from_key_pair(&key_pair)
        .map_err(|e| DtlsError::Identity(e.to_string()))?;

    Ok(DtlsCertificate {
        certificate: certs,
        private_key,
    })
}

/// Perform the DTLS handshake over a connected, punched UDP socket and
/// verify the peer's identity.
pub async fn upgrade_to_dtls(
    socket: Arc<UdpSocket>,
    cert_pem: &str,
    key_pem: &str,
    expected_peer: &NodeId,
    is_client: bool,
    handshake_timeout: f64,
) -> Result<DtlsPeerConnection, DtlsError> {
    let certificate = dtls_certificate(cert_pem, key_pem)?;

    let config = Config {
        certificates: vec![certificate],
        insecure_skip_verify: true,
        client_auth: ClientAuthType::RequireAnyClientCert,
        extended_master_secret: ExtendedMasterSecretType::Require,
        ..Default::default()
    };

    debug!(
        "Starting DTLS handshake ({}, timeout={:.1}s)",
        if is_client { "client" } else { "server" },
        handshake_timeout
    );

    let conn: Arc<dyn Conn + Send + Sync> = socket;
    let dtls = tokio::time::timeout(
        Duration::from_secs_f64(handshake_timeout),
        DTLSConn::new(conn, config, is_client, None),
    )
    .await
    .map_err(|_| DtlsError::HandshakeTimeout(handshake_timeout))?
    .map_err(|e| DtlsError::Handshake(e.to_string()))?;

    // Mutual auth happened above transport policy; identity is pinned here
    let state = dtls.connection_state().await;
    let peer_der = state
        .peer_certificates
        .first()
        .ok_or(DtlsError::MissingCertificate)?;
    let peer_id = node_id_from_cert_der(peer_der).map_err(|e| DtlsError::Handshake(e.to_string()))?;

    if &peer_id != expected_peer {
        warn!(
            "DTLS certificate validation failed: expected {}, got {}",
            expected_peer, peer_id
        );
        let _ = dtls.close().await;
        return Err(DtlsError::CertificateMismatch {
            expected: expected_peer.to_string(),
            got: peer_id.to_string(),
        });
    }

    info!("DTLS handshake complete, peer identity {}", peer_id.short());
    Ok(DtlsPeerConnection {
        node_id: expected_peer.clone(),
        dtls: Arc::new(dtls),
        strategy: StrategySlot::default(),
    })
}

/// Framed messaging over an established DTLS session. One message is one
/// datagram: `header ‖ body`.
pub struct DtlsPeerConnection {
    node_id: NodeId,
    dtls: Arc<DTLSConn>,
    strategy: StrategySlot,
}

#[async_trait]
impl PeerConnection for DtlsPeerConnection {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn transport(&self) -> Transport {
        Transport::UdpDtls
    }

    fn strategy_used(&self) -> Option<String> {
        self.strategy.get()
    }

    fn set_strategy_used(&self, strategy: &str) {
        self.strategy.set(strategy);
    }

    async fn send(&self, message: &Value) -> Result<(), ConnectionError> {
        let frame = framing::encode_frame(message);
        self.dtls
            .send(&frame)
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Value>, ConnectionError> {
        let mut buf = vec![0u8; 65536];
        let len = match self.dtls.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                debug!("DTLS receive ended for {}: {}", self.node_id.short(), e);
                return Ok(None);
            }
        };
        if len == 0 {
            return Ok(None);
        }

        match framing::decode_frame(&buf[..len]) {
            Ok(message) => Ok(Some(message)),
            Err(e) => Err(ConnectionError::Protocol(e.to_string())),
        }
    }

    async fn close(&self) {
        // Sends the close alert; the UDP socket itself stays open for the
        // caller to dispose of
        if let Err(e) = self.dtls.close().await {
            debug!("DTLS close for {}: {}", self.node_id.short(), e);
        }
    }
}
