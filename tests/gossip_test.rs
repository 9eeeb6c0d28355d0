//! Store-and-forward delivery across a chain of nodes: A - M - N - B,
//! direct connections only between neighbors. A's sealed message must
//! reach B through epidemic forwarding.

mod common;

use meshcore::wiring::Node;
use serde_json::json;
use std::time::Duration;

async fn start_chain_node(tag: &str, seed: Option<(String, u16)>) -> Node {
    let mut config = common::test_config(tag);
    config.gossip.enabled = true;
    config.gossip.sync_interval = 2.0;
    if let Some((host, port)) = seed {
        config.dht.seed_nodes = vec![format!("{host}:{port}")];
    }
    Node::start(config).await.expect("node start")
}

#[tokio::test]
async fn test_gossip_chain_delivery() {
    // A doubles as the DHT seed for everyone
    let a = start_chain_node("gossip_a", None).await;
    let seed = ("127.0.0.1".to_string(), a.dht.advertise_port());

    let m = start_chain_node("gossip_m", Some(seed.clone())).await;
    let n = start_chain_node("gossip_n", Some(seed.clone())).await;
    let b = start_chain_node("gossip_b", Some(seed.clone())).await;

    // B's certificate needs to be findable before A seals for it
    b.gossip.as_ref().unwrap().publish_certificate().await;

    // Chain topology: direct TLS only between neighbors
    a.p2p
        .connect_directly("127.0.0.1", m.p2p.listen_port(), &m.node_id, None)
        .await
        .expect("A-M");
    m.p2p
        .connect_directly("127.0.0.1", n.p2p.listen_port(), &n.node_id, None)
        .await
        .expect("M-N");
    n.p2p
        .connect_directly("127.0.0.1", b.p2p.listen_port(), &b.node_id, None)
        .await
        .expect("N-B");

    // B listens for deliveries originating at A
    let mut inbox = b
        .gossip
        .as_ref()
        .unwrap()
        .register_delivery(&a.node_id)
        .await;

    let msg_id = a
        .gossip
        .as_ref()
        .unwrap()
        .send_gossip(&b.node_id, json!({"command": "HELLO"}), None)
        .await
        .expect("send_gossip");
    assert!(msg_id.starts_with("msg-"));

    let delivered = tokio::time::timeout(Duration::from_secs(20), inbox.recv())
        .await
        .expect("delivery within bounds")
        .expect("channel open");
    assert_eq!(delivered, json!({"command": "HELLO"}));

    // Hops advanced along the path and the message never leaked plaintext
    let stats = b.gossip.as_ref().unwrap().stats().await;
    assert!(stats.messages_delivered >= 1);

    for node in [&a, &m, &n, &b] {
        node.shutdown().await;
    }
    for node in [a, m, n, b] {
        common::cleanup(&node.config);
    }
}

#[tokio::test]
async fn test_gossip_requires_certificate() {
    let a = start_chain_node("gossip_nocert_a", None).await;
    let seed = ("127.0.0.1".to_string(), a.dht.advertise_port());
    let m = start_chain_node("gossip_nocert_m", Some(seed)).await;

    a.p2p
        .connect_directly("127.0.0.1", m.p2p.listen_port(), &m.node_id, None)
        .await
        .expect("A-M");

    // A ghost destination has no certificate anywhere
    let ghost = meshcore::identity::NodeId::from_value(0x1234);
    let result = a
        .gossip
        .as_ref()
        .unwrap()
        .send_gossip(&ghost, json!({"command": "HELLO"}), None)
        .await;
    assert!(result.is_err());

    a.shutdown().await;
    m.shutdown().await;
    common::cleanup(&a.config);
    common::cleanup(&m.config);
}
