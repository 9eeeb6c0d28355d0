//! Live-socket DHT integration: bootstrap, lookup convergence, and the
//! announce/resolve round trip over loopback UDP.

use meshcore::config::DhtConfig;
use meshcore::dht::{DhtManager, Ipv4Info, PeerEndpoint};
use meshcore::identity::NodeId;
use std::sync::Arc;

fn dht_config() -> DhtConfig {
    DhtConfig {
        port: 0,
        rpc_timeout: 1.0,
        rpc_retries: 2,
        lookup_timeout: 3.0,
        bootstrap_timeout: 5.0,
        ..Default::default()
    }
}

async fn start_node(v: u128) -> Arc<DhtManager> {
    DhtManager::start(NodeId::from_value(v), "127.0.0.1".to_string(), dht_config())
        .await
        .expect("dht start")
}

#[tokio::test]
async fn test_two_node_lookup() {
    let seed = start_node(0x10).await;
    let seed_addr = ("127.0.0.1".to_string(), seed.advertise_port());

    let b = start_node(2).await;
    assert!(b.bootstrap(vec![seed_addr.clone()]).await);

    let a = start_node(1).await;
    assert!(a.bootstrap(vec![seed_addr]).await);

    // After bootstrapping through the shared seed, A's lookup for B puts
    // B first in the shortlist (distance zero)
    let shortlist = a.find_node(b.node_id()).await;
    assert!(!shortlist.is_empty());
    assert_eq!(&shortlist[0].node_id, b.node_id());

    a.stop().await;
    b.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn test_announce_and_resolve() {
    let seed = start_node(0x20).await;
    let seed_addr = ("127.0.0.1".to_string(), seed.advertise_port());

    let b = start_node(0x22).await;
    assert!(b.bootstrap(vec![seed_addr.clone()]).await);
    let stored = b.announce().await;
    assert!(stored >= 1, "announce should reach the seed");

    let a = start_node(0x21).await;
    assert!(a.bootstrap(vec![seed_addr]).await);

    let (ip, port) = a.find_peer(b.node_id()).await.expect("peer resolvable");
    assert_eq!(ip, "127.0.0.1");
    assert_eq!(port, b.advertise_port());

    a.stop().await;
    b.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn test_announce_v2_endpoint_record() {
    let seed = start_node(0x30).await;
    let seed_addr = ("127.0.0.1".to_string(), seed.advertise_port());

    let b = start_node(0x32).await;
    assert!(b.bootstrap(vec![seed_addr.clone()]).await);

    let endpoint = PeerEndpoint::new(
        b.node_id().clone(),
        Ipv4Info {
            local: "10.0.0.2:9001".into(),
            external: Some("203.0.113.50:9001".into()),
            nat_type: None,
        },
    );
    b.set_announce_value(endpoint.to_json()).await;
    assert!(b.announce().await >= 1);

    let a = start_node(0x31).await;
    assert!(a.bootstrap(vec![seed_addr]).await);

    let resolved = a.find_peer_full(b.node_id()).await.expect("endpoint record");
    assert_eq!(resolved.schema_version, "2.0");
    assert_eq!(
        resolved.primary_ipv4_address().unwrap(),
        ("10.0.0.2".to_string(), 9001)
    );
    assert_eq!(
        resolved.external_ipv4_address().unwrap(),
        ("203.0.113.50".to_string(), 9001)
    );

    a.stop().await;
    b.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn test_repeated_lookup_is_idempotent() {
    let seed = start_node(0x40).await;
    let seed_addr = ("127.0.0.1".to_string(), seed.advertise_port());

    let b = start_node(0x42).await;
    assert!(b.bootstrap(vec![seed_addr.clone()]).await);
    let a = start_node(0x41).await;
    assert!(a.bootstrap(vec![seed_addr]).await);

    let first = a.find_node(b.node_id()).await;
    let second = a.find_node(b.node_id()).await;
    let first_ids: Vec<_> = first.iter().map(|n| n.node_id.clone()).collect();
    let second_ids: Vec<_> = second.iter().map(|n| n.node_id.clone()).collect();
    assert_eq!(first_ids, second_ids);

    a.stop().await;
    b.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn test_bootstrap_fails_without_seeds() {
    let a = start_node(0x50).await;
    assert!(!a.bootstrap(vec![]).await);

    // A dead seed also fails, inside the bootstrap budget
    let dead = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);
    assert!(!a.bootstrap(vec![("127.0.0.1".to_string(), dead_port)]).await);

    a.stop().await;
}
