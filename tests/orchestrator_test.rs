//! Orchestrator semantics with mock strategies: priority order, silent
//! skipping, failure continuation, and the composite exhaustion error.

mod common;

use async_trait::async_trait;
use meshcore::config::DhtConfig;
use meshcore::dht::{DhtManager, Ipv4Info, PeerEndpoint};
use meshcore::identity::{NodeId, NodeIdentity};
use meshcore::p2p::P2pManager;
use meshcore::peer_cache::PeerCache;
use meshcore::router::MessageRouter;
use meshcore::strategy::{
    ConnectionOrchestrator, ConnectionStrategy, OrchestratorError, StrategyContext, StrategyError,
};
use meshcore::transport::{ConnectionError, PeerConnection, StrategySlot, Transport};
use serde_json::Value;
use std::sync::Arc;

/// A connection that exists only to carry its strategy label.
struct MockConnection {
    node_id: NodeId,
    strategy: StrategySlot,
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }
    fn transport(&self) -> Transport {
        // Virtual: keeps the registry from spawning a listener task
        Transport::Gossip
    }
    fn strategy_used(&self) -> Option<String> {
        self.strategy.get()
    }
    fn set_strategy_used(&self, strategy: &str) {
        self.strategy.set(strategy);
    }
    async fn send(&self, _message: &Value) -> Result<(), ConnectionError> {
        Ok(())
    }
    async fn read(&self) -> Result<Option<Value>, ConnectionError> {
        Ok(None)
    }
    async fn close(&self) {}
}

#[derive(Clone, Copy)]
enum Behavior {
    Inapplicable,
    Fails,
    Succeeds,
}

struct MockStrategy {
    name: &'static str,
    priority: u8,
    behavior: Behavior,
}

#[async_trait]
impl ConnectionStrategy for MockStrategy {
    fn name(&self) -> &'static str {
        self.name
    }
    fn priority(&self) -> u8 {
        self.priority
    }
    fn timeout(&self) -> f64 {
        2.0
    }
    fn is_applicable(&self, _endpoints: &PeerEndpoint, _ctx: &StrategyContext) -> bool {
        !matches!(self.behavior, Behavior::Inapplicable)
    }
    async fn connect(
        &self,
        node_id: &NodeId,
        _endpoints: &PeerEndpoint,
        _ctx: &StrategyContext,
    ) -> Result<Arc<dyn PeerConnection>, StrategyError> {
        match self.behavior {
            Behavior::Inapplicable => Err(StrategyError::NotApplicable("mock".into())),
            Behavior::Fails => Err(StrategyError::Failed("mock failure".into())),
            Behavior::Succeeds => Ok(Arc::new(MockConnection {
                node_id: node_id.clone(),
                strategy: StrategySlot::default(),
            })),
        }
    }
}

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

/// Seed + announced target + a P2P manager for the context. Returns the
/// context and the announced peer's id.
async fn harness(tag: u128) -> (StrategyContext, NodeId, Vec<Arc<DhtManager>>) {
    let seed = DhtManager::start(
        NodeId::from_value(tag),
        "127.0.0.1".to_string(),
        dht_config(),
    )
    .await
    .unwrap();
    let seed_addr = ("127.0.0.1".to_string(), seed.advertise_port());

    let target = DhtManager::start(
        NodeId::from_value(tag + 1),
        "127.0.0.1".to_string(),
        dht_config(),
    )
    .await
    .unwrap();
    assert!(target.bootstrap(vec![seed_addr.clone()]).await);

    let endpoint = PeerEndpoint::new(
        target.node_id().clone(),
        Ipv4Info {
            local: "127.0.0.1:9999".into(),
            external: None,
            nat_type: None,
        },
    );
    target.set_announce_value(endpoint.to_json()).await;
    assert!(target.announce().await >= 1);

    let local = DhtManager::start(
        NodeId::from_value(tag + 2),
        "127.0.0.1".to_string(),
        dht_config(),
    )
    .await
    .unwrap();
    assert!(local.bootstrap(vec![seed_addr]).await);

    let config = common::test_config(&format!("orchestrator_{tag}"));
    let identity = NodeIdentity::load_or_generate(&config.data_dir).unwrap();
    let router = Arc::new(MessageRouter::new());
    let cache = PeerCache::load(config.data_dir.join("peer_cache.json"));
    let p2p = P2pManager::new(&identity, config, Arc::clone(&local), router, cache).unwrap();

    let ctx = StrategyContext {
        p2p,
        dht: Arc::clone(&local),
        punch: None,
        relay: None,
        gossip: None,
    };
    let target_id = target.node_id().clone();
    (ctx, target_id, vec![seed, target, local])
}

#[tokio::test]
async fn test_priority_order_selects_first_success() {
    let (ctx, target, nodes) = harness(0x100).await;

    let strategies: Vec<Arc<dyn ConnectionStrategy>> = vec![
        Arc::new(MockStrategy { name: "mock_one", priority: 1, behavior: Behavior::Fails }),
        Arc::new(MockStrategy { name: "mock_two", priority: 2, behavior: Behavior::Inapplicable }),
        Arc::new(MockStrategy { name: "mock_three", priority: 3, behavior: Behavior::Succeeds }),
        Arc::new(MockStrategy { name: "mock_four", priority: 4, behavior: Behavior::Succeeds }),
    ];
    let orchestrator = ConnectionOrchestrator::new(ctx.clone(), strategies, 30.0);

    let connection = orchestrator.connect(&target, None).await.unwrap();
    assert_eq!(connection.strategy_used().as_deref(), Some("mock_three"));
    assert!(ctx.p2p.is_connected(&target).await);

    let stats = orchestrator.stats().await;
    assert_eq!(stats.successful_connections, 1);
    assert_eq!(stats.strategy_usage.get("mock_three"), Some(&1));
    assert!(stats.strategy_usage.get("mock_four").is_none());

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_exhaustion_reports_last_failure() {
    let (ctx, target, nodes) = harness(0x200).await;

    let strategies: Vec<Arc<dyn ConnectionStrategy>> = vec![
        Arc::new(MockStrategy { name: "mock_one", priority: 1, behavior: Behavior::Fails }),
        Arc::new(MockStrategy { name: "mock_two", priority: 2, behavior: Behavior::Fails }),
    ];
    let orchestrator = ConnectionOrchestrator::new(ctx, strategies, 30.0);

    match orchestrator.connect(&target, None).await {
        Err(OrchestratorError::Exhausted { last_strategy, last_error, .. }) => {
            assert_eq!(last_strategy, "mock_two");
            assert!(last_error.contains("mock failure"));
        }
        other => panic!("expected exhaustion, got {:?}", other.map(|_| "connection")),
    }

    let stats = orchestrator.stats().await;
    assert_eq!(stats.failed_connections, 1);
    assert_eq!(stats.last_attempts.len(), 2);

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_unannounced_peer_fails_before_strategies() {
    let (ctx, _target, nodes) = harness(0x300).await;

    let strategies: Vec<Arc<dyn ConnectionStrategy>> = vec![Arc::new(MockStrategy {
        name: "mock_one",
        priority: 1,
        behavior: Behavior::Succeeds,
    })];
    let orchestrator = ConnectionOrchestrator::new(ctx, strategies, 30.0);

    let ghost = NodeId::from_value(0xdead_beef);
    match orchestrator.connect(&ghost, None).await {
        Err(OrchestratorError::NotAnnounced(id)) => assert_eq!(id, ghost.to_string()),
        other => panic!("expected NotAnnounced, got {:?}", other.map(|_| "connection")),
    }

    for node in nodes {
        node.stop().await;
    }
}
