//! DTLS upgrade over loopback UDP: mutual handshake, identity pinning,
//! framed round trip, and the certificate-mismatch abort.

mod common;

use meshcore::identity::{NodeId, NodeIdentity};
use meshcore::transport::{upgrade_to_dtls, DtlsError, PeerConnection};
use serde_json::json;
use std::sync::Arc;
use tokio::net::UdpSocket;

async fn socket_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();
    a.connect(addr_b).await.unwrap();
    b.connect(addr_a).await.unwrap();
    (Arc::new(a), Arc::new(b))
}

fn identity(tag: &str) -> NodeIdentity {
    NodeIdentity::load_or_generate(&common::scratch_dir(tag)).unwrap()
}

#[tokio::test]
async fn test_dtls_handshake_and_roundtrip() {
    let alice = identity("dtls_alice");
    let bob = identity("dtls_bob");
    let (sock_a, sock_b) = socket_pair().await;

    let bob_cert = bob.cert_pem.clone();
    let bob_key = bob.key_pem.clone();
    let alice_id = alice.node_id.clone();
    let server = tokio::spawn(async move {
        upgrade_to_dtls(sock_b, &bob_cert, &bob_key, &alice_id, false, 15.0).await
    });

    let client = upgrade_to_dtls(
        sock_a,
        &alice.cert_pem,
        &alice.key_pem,
        &bob.node_id,
        true,
        15.0,
    )
    .await
    .expect("client handshake");
    let server = server.await.unwrap().expect("server handshake");

    // Framed message survives the encrypted datagram path
    let hello = json!({"command": "HELLO", "payload": {}});
    client.send(&hello).await.expect("send");
    let received = server.read().await.expect("read").expect("frame");
    assert_eq!(received, hello);

    // And the reverse direction
    let reply = json!({"command": "HELLO_ACK", "payload": {"status": "OK"}});
    server.send(&reply).await.expect("send back");
    let received = client.read().await.expect("read").expect("frame");
    assert_eq!(received, reply);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_dtls_rejects_wrong_identity() {
    let alice = identity("dtls_wrong_alice");
    let bob = identity("dtls_wrong_bob");
    let (sock_a, sock_b) = socket_pair().await;

    // The server expects somebody who is not Alice
    let bob_cert = bob.cert_pem.clone();
    let bob_key = bob.key_pem.clone();
    let impostor = NodeId::from_value(0xbad);
    let impostor_clone = impostor.clone();
    let server = tokio::spawn(async move {
        upgrade_to_dtls(sock_b, &bob_cert, &bob_key, &impostor_clone, false, 15.0).await
    });

    let client = upgrade_to_dtls(
        sock_a,
        &alice.cert_pem,
        &alice.key_pem,
        &bob.node_id,
        true,
        15.0,
    )
    .await;

    let server = server.await.unwrap();
    match server {
        Err(DtlsError::CertificateMismatch { expected, got }) => {
            assert_eq!(expected, impostor.to_string());
            assert_eq!(got, alice.node_id.to_string());
        }
        Err(other) => panic!("expected certificate mismatch, got {other}"),
        Ok(_) => panic!("handshake with wrong identity must not yield a connection"),
    }
    // The client may have completed its half before the server aborted;
    // either way it must not be usable against a peer that bailed out
    if let Ok(client) = client {
        client.close().await;
    }
}
