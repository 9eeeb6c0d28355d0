//! Direct-TLS transport: rustls configs for the listener and client, and
//! the framed stream connection.
//!
//! The client config deliberately skips transport-level certificate
//! verification; identity is pinned above the transport by the HELLO
//! exchange keyed on node ID. See DESIGN.md for the trade-off record.

use super::{framing, ConnectionError, PeerConnection, StrategySlot, Transport};
use crate::identity::NodeId;
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsStream;
use tracing::warn;

/// Server config from our PEM certificate and key.
pub fn server_config(cert_pem: &str, key_pem: &str) -> io::Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in PEM"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Arc::new(config))
}

/// Client config with certificate verification disabled at the transport.
pub fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    Arc::new(config)
}

/// Accepts any server certificate; peer identity is established by the
/// HELLO exchange, not by the certificate chain.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A direct TLS connection carrying framed JSON messages.
pub struct TlsPeerConnection {
    node_id: NodeId,
    transport: Transport,
    peer_addr: Option<SocketAddr>,
    reader: Mutex<ReadHalf<TlsStream<TcpStream>>>,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    strategy: StrategySlot,
}

impl TlsPeerConnection {
    pub fn new(node_id: NodeId, stream: TlsStream<TcpStream>) -> Self {
        let peer_addr = stream.get_ref().0.peer_addr().ok();
        let transport = match peer_addr {
            Some(addr) if addr.is_ipv6() => Transport::DirectTlsV6,
            _ => Transport::DirectTlsV4,
        };
        let (reader, writer) = tokio::io::split(stream);
        Self {
            node_id,
            transport,
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            strategy: StrategySlot::default(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Re-key the connection once the peer's real identity is known
    /// (inbound connections learn it from HELLO).
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }
}

#[async_trait]
impl PeerConnection for TlsPeerConnection {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn strategy_used(&self) -> Option<String> {
        self.strategy.get()
    }

    fn set_strategy_used(&self, strategy: &str) {
        self.strategy.set(strategy);
    }

    async fn send(&self, message: &Value) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        framing::write_frame(&mut *writer, message)
            .await
            .map_err(ConnectionError::from)
    }

    async fn read(&self) -> Result<Option<Value>, ConnectionError> {
        let mut reader = self.reader.lock().await;
        framing::read_frame(&mut *reader)
            .await
            .map_err(ConnectionError::from)
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        // shutdown sends the TLS close_notify; bound it so a dead peer
        // cannot stall teardown
        if tokio::time::timeout(Duration::from_secs(2), writer.shutdown())
            .await
            .is_err()
        {
            warn!("TLS shutdown timed out for peer {}", self.node_id.short());
        }
    }
}
