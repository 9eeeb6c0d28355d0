//! Relay pairing and forwarding: two peers that cannot reach each other
//! directly register with a volunteer relay and exchange a message.

mod common;

use meshcore::relay::RelayDescriptor;
use meshcore::wiring::Node;
use serde_json::json;
use std::time::Duration;

async fn start_relay_node(tag: &str, volunteer: bool, seed: Option<(String, u16)>) -> Node {
    let mut config = common::test_config(tag);
    config.relay.enabled = true;
    config.relay.volunteer = volunteer;
    config.relay.register_timeout = 10.0;
    if let Some((host, port)) = seed {
        config.dht.seed_nodes = vec![format!("{host}:{port}")];
    }
    Node::start(config).await.expect("node start")
}

fn descriptor_for(node: &Node) -> RelayDescriptor {
    RelayDescriptor {
        node_id: node.node_id.clone(),
        ip: "127.0.0.1".into(),
        port: node.p2p.listen_port(),
        available: true,
        max_peers: 10,
        current_peers: 0,
        region: "global".into(),
        uptime: 1.0,
        latency_ms: 10.0,
        bandwidth_mbps: 10.0,
        discovered_at: 0.0,
    }
}

#[tokio::test]
async fn test_relay_session_roundtrip() {
    let relay = start_relay_node("relay_r", true, None).await;
    let seed = ("127.0.0.1".to_string(), relay.dht.advertise_port());

    let s = start_relay_node("relay_s", false, Some(seed.clone())).await;
    let t = start_relay_node("relay_t", false, Some(seed)).await;

    let descriptor = descriptor_for(&relay);
    let s_manager = s.relay.as_ref().unwrap();
    let t_manager = t.relay.as_ref().unwrap();

    // Both sides register concurrently; the second registration pairs
    // them and RELAY_READY goes to both
    let (s_conn, t_conn) = tokio::join!(
        s_manager.connect_via_relay(&t.node_id, &descriptor),
        t_manager.connect_via_relay(&s.node_id, &descriptor),
    );
    let s_conn = s_conn.expect("S side session");
    let t_conn = t_conn.expect("T side session");
    assert_eq!(s_conn.session_id(), t_conn.session_id());

    use meshcore::transport::PeerConnection;
    s_conn
        .send(&json!({"command": "HELLO", "payload": {}}))
        .await
        .expect("send through relay");

    let received = tokio::time::timeout(Duration::from_secs(10), t_conn.read())
        .await
        .expect("read within bounds")
        .expect("read ok")
        .expect("message present");
    assert_eq!(received, json!({"command": "HELLO", "payload": {}}));

    // The relay forwarded bytes it could not decrypt, and counted them
    let stats = relay.relay.as_ref().unwrap().stats().await;
    assert!(stats.sessions_created >= 1);
    assert!(stats.messages_relayed >= 1);
    assert!(stats.bytes_relayed > 0);

    s_conn.close().await;

    for node in [&relay, &s, &t] {
        node.shutdown().await;
    }
    for node in [relay, s, t] {
        common::cleanup(&node.config);
    }
}

#[tokio::test]
async fn test_non_volunteer_rejects_registration() {
    let not_relay = start_relay_node("relay_nv", false, None).await;
    let seed = ("127.0.0.1".to_string(), not_relay.dht.advertise_port());
    let s = start_relay_node("relay_nv_s", false, Some(seed)).await;

    let descriptor = descriptor_for(&not_relay);
    let target = meshcore::identity::NodeId::from_value(0x7777);
    let result = s
        .relay
        .as_ref()
        .unwrap()
        .connect_via_relay(&target, &descriptor)
        .await;
    assert!(result.is_err());

    not_relay.shutdown().await;
    s.shutdown().await;
    common::cleanup(&not_relay.config);
    common::cleanup(&s.config);
}
