//! Direct-TLS path: HELLO exchange, message routing, pre-flight
//! diagnostics, and intentional-disconnect semantics.

mod common;

use meshcore::p2p::P2pError;
use meshcore::wiring::Node;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn start_plain_node(tag: &str) -> Node {
    Node::start(common::test_config(tag)).await.expect("node start")
}

#[tokio::test]
async fn test_direct_connect_and_route() {
    let a = start_plain_node("p2p_a").await;
    let b = start_plain_node("p2p_b").await;

    let received = Arc::new(AtomicU32::new(0));
    {
        let received = Arc::clone(&received);
        b.router
            .register("SEND_TEXT", move |_sender, payload| {
                let received = Arc::clone(&received);
                async move {
                    assert_eq!(payload["text"], "hi");
                    received.fetch_add(1, Ordering::SeqCst);
                    None
                }
            })
            .await;
    }

    let connection = a
        .p2p
        .connect_directly("127.0.0.1", b.p2p.listen_port(), &b.node_id, None)
        .await
        .expect("direct connect");
    assert_eq!(connection.strategy_used().as_deref(), Some("ipv4_direct"));

    // Both registries know the link
    assert!(a.p2p.is_connected(&b.node_id).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.p2p.is_connected(&a.node_id).await);

    a.p2p
        .send_to_peer(&b.node_id, &json!({"command": "SEND_TEXT", "payload": {"text": "hi"}}))
        .await
        .expect("send");

    tokio::time::timeout(Duration::from_secs(5), async {
        while received.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("message routed");

    a.shutdown().await;
    b.shutdown().await;
    common::cleanup(&a.config);
    common::cleanup(&b.config);
}

#[tokio::test]
async fn test_preflight_distinguishes_refused() {
    let a = start_plain_node("p2p_preflight").await;

    // Grab a port nobody listens on
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let target = meshcore::identity::NodeId::from_value(0x99);
    match a
        .p2p
        .connect_directly("127.0.0.1", dead_port, &target, Some(3.0))
        .await
    {
        Err(P2pError::PreflightRefused { addr }) => {
            assert!(addr.contains(&dead_port.to_string()));
        }
        other => panic!(
            "expected PreflightRefused, got {:?}",
            other.map(|_| "connection")
        ),
    }

    a.shutdown().await;
    common::cleanup(&a.config);
}

#[tokio::test]
async fn test_intentional_disconnect_suppresses_reconnect() {
    let a = start_plain_node("p2p_intent_a").await;
    let b = start_plain_node("p2p_intent_b").await;

    a.p2p
        .connect_directly("127.0.0.1", b.p2p.listen_port(), &b.node_id, None)
        .await
        .expect("direct connect");

    a.p2p.shutdown_peer_connection(&b.node_id).await;
    assert!(!a.p2p.is_connected(&b.node_id).await);

    // Longer than the reconnect delay: no connection should reappear
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!a.p2p.is_connected(&b.node_id).await);

    a.shutdown().await;
    b.shutdown().await;
    common::cleanup(&a.config);
    common::cleanup(&b.config);
}

#[tokio::test]
async fn test_hello_name_lands_in_peer_cache() {
    let mut config_a = common::test_config("p2p_name_a");
    config_a.display_name = Some("Alpha".into());
    let a = Node::start(config_a).await.unwrap();

    let mut config_b = common::test_config("p2p_name_b");
    config_b.display_name = Some("Beta".into());
    let b = Node::start(config_b).await.unwrap();

    a.p2p
        .connect_directly("127.0.0.1", b.p2p.listen_port(), &b.node_id, None)
        .await
        .expect("direct connect");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A learned B's name from HELLO_ACK; B learned A's from HELLO
    let b_as_seen_by_a = a.p2p.cached_peer(&b.node_id).await.unwrap();
    assert_eq!(b_as_seen_by_a.display_name.as_deref(), Some("Beta"));
    assert!(b_as_seen_by_a.supports_direct);

    let a_as_seen_by_b = b.p2p.cached_peer(&a.node_id).await.unwrap();
    assert_eq!(a_as_seen_by_b.display_name.as_deref(), Some("Alpha"));

    a.shutdown().await;
    b.shutdown().await;
    common::cleanup(&a.config);
    common::cleanup(&b.config);
}
