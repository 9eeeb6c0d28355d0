//! Node assembly: builds every manager from the configuration, wires the
//! cross-references, and registers the core command handlers.

use crate::config::Config;
use crate::dht::DhtManager;
use crate::gossip::{GossipManager, GossipMessage};
use crate::identity::{NodeId, NodeIdentity};
use crate::p2p::{P2pError, P2pManager};
use crate::peer_cache::{PeerCache, PeerUpdate};
use crate::punch::HolePunchManager;
use crate::relay::RelayManager;
use crate::router::MessageRouter;
use crate::strategy::{default_strategies, ConnectionOrchestrator, StrategyContext};
use crate::transport::PeerConnection;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hole punch error: {0}")]
    Punch(#[from] crate::punch::PunchError),
}

/// A fully wired node: DHT, P2P listener, hole punching, relay, gossip,
/// and the connection orchestrator.
pub struct Node {
    pub node_id: NodeId,
    pub config: Config,
    pub dht: Arc<DhtManager>,
    pub p2p: Arc<P2pManager>,
    pub punch: Option<Arc<HolePunchManager>>,
    pub relay: Option<Arc<RelayManager>>,
    pub gossip: Option<Arc<GossipManager>>,
    pub orchestrator: Arc<ConnectionOrchestrator>,
    pub router: Arc<MessageRouter>,
}

impl Node {
    /// Build and start everything. Bootstraps from the configured seeds
    /// when any are present.
    pub async fn start(config: Config) -> Result<Self, NodeError> {
        let identity = NodeIdentity::load_or_generate(&config.data_dir)?;
        let node_id = identity.node_id.clone();
        info!("Starting node {}", node_id);

        let advertise_ip = primary_local_ip().await;
        let dht = DhtManager::start(node_id.clone(), advertise_ip.clone(), config.dht.clone())
            .await?;

        let router = Arc::new(MessageRouter::new());
        let peer_cache = PeerCache::load(config.data_dir.join("peer_cache.json"));
        let p2p = P2pManager::new(
            &identity,
            config.clone(),
            Arc::clone(&dht),
            Arc::clone(&router),
            peer_cache,
        )?;
        p2p.start_server().await?;
        p2p.set_advertised_ip(advertise_ip).await;

        let punch = if config.hole_punch.enabled {
            match HolePunchManager::start(Arc::clone(&dht), config.hole_punch.clone()).await {
                Ok(punch) => {
                    p2p.set_punch(Arc::clone(&punch));
                    Some(punch)
                }
                Err(e) => {
                    warn!("Hole punching unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let relay = if config.relay.enabled {
            let relay = RelayManager::new(node_id.clone(), Arc::clone(&dht), config.relay.clone());
            relay.set_p2p(Arc::clone(&p2p));
            relay.start().await;
            Some(relay)
        } else {
            None
        };

        let gossip = if config.gossip.enabled {
            let gossip = GossipManager::new(
                node_id.clone(),
                Arc::new(identity.private_key.clone()),
                identity.cert_pem.clone(),
                Arc::clone(&dht),
                config.gossip.clone(),
            );
            gossip.set_p2p(Arc::clone(&p2p));
            gossip.set_router(Arc::clone(&router));
            gossip.start().await;
            Some(gossip)
        } else {
            None
        };

        let ctx = StrategyContext {
            p2p: Arc::clone(&p2p),
            dht: Arc::clone(&dht),
            punch: punch.clone(),
            relay: relay.clone(),
            gossip: gossip.clone(),
        };
        let orchestrator = ConnectionOrchestrator::new(
            ctx,
            default_strategies(&config.strategies),
            config.strategies.overall_timeout,
        );
        p2p.set_orchestrator(Arc::clone(&orchestrator));

        register_core_handlers(&router, &p2p, gossip.as_ref(), relay.as_ref()).await;

        let seeds = config.seed_addrs();
        if !seeds.is_empty() {
            if dht.bootstrap(seeds).await {
                p2p.refresh_announce_value().await;
                dht.announce().await;
                // The startup publication ran against an empty table
                if let Some(gossip) = &gossip {
                    gossip.publish_certificate().await;
                }
            } else {
                warn!("Bootstrap failed; maintenance loop will retry");
            }
        }

        Ok(Self {
            node_id,
            config,
            dht,
            p2p,
            punch,
            relay,
            gossip,
            orchestrator,
            router,
        })
    }

    /// Connect to a peer by node ID (registry, hot path, orchestrator).
    pub async fn connect(&self, target: &NodeId) -> Result<Arc<dyn PeerConnection>, P2pError> {
        self.p2p.connect_via_node_id(target).await
    }

    pub async fn shutdown(&self) {
        info!("Node {} shutting down", self.node_id.short());
        if let Some(gossip) = &self.gossip {
            gossip.stop().await;
        }
        if let Some(relay) = &self.relay {
            relay.stop().await;
        }
        if let Some(punch) = &self.punch {
            punch.stop().await;
        }
        self.p2p.shutdown_all().await;
    }
}

/// Register the commands the core itself consumes. Everything else falls
/// through to whatever handlers the application adds.
pub async fn register_core_handlers(
    router: &Arc<MessageRouter>,
    p2p: &Arc<P2pManager>,
    gossip: Option<&Arc<GossipManager>>,
    relay: Option<&Arc<RelayManager>>,
) {
    {
        let p2p = Arc::clone(p2p);
        router
            .register("HELLO", move |sender, payload| {
                let p2p = Arc::clone(&p2p);
                async move {
                    let name = payload
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if name.is_some() {
                        p2p.update_peer_cache(
                            &sender,
                            PeerUpdate {
                                display_name: name,
                                ..Default::default()
                            },
                        )
                        .await;
                    }
                    None
                }
            })
            .await;
    }

    if let Some(gossip) = gossip {
        {
            let gossip = Arc::clone(gossip);
            router
                .register("GOSSIP_MESSAGE", move |_sender, payload| {
                    let gossip = Arc::clone(&gossip);
                    async move {
                        // Anti-entropy resends nest the message one level
                        let raw = payload.get("gossip_message").cloned().unwrap_or(payload);
                        match serde_json::from_value::<GossipMessage>(raw) {
                            Ok(message) => gossip.handle_gossip_message(message).await,
                            Err(e) => warn!("Malformed GOSSIP_MESSAGE payload: {}", e),
                        }
                        None
                    }
                })
                .await;
        }
        {
            let gossip = Arc::clone(gossip);
            router
                .register("GOSSIP_SYNC", move |sender, payload| {
                    let gossip = Arc::clone(&gossip);
                    async move {
                        gossip.handle_gossip_sync(sender, payload).await;
                        None
                    }
                })
                .await;
        }
    }

    if let Some(relay) = relay {
        {
            let relay = Arc::clone(relay);
            router
                .register("RELAY_REGISTER", move |sender, payload| {
                    let relay = Arc::clone(&relay);
                    async move {
                        relay.handle_register(sender, payload).await;
                        None
                    }
                })
                .await;
        }
        {
            let relay = Arc::clone(relay);
            router
                .register("RELAY_MESSAGE", move |sender, payload| {
                    let relay = Arc::clone(&relay);
                    async move {
                        relay.handle_message(sender, payload).await;
                        None
                    }
                })
                .await;
        }
        {
            let relay = Arc::clone(relay);
            router
                .register("RELAY_DISCONNECT", move |sender, payload| {
                    let relay = Arc::clone(&relay);
                    async move {
                        relay.handle_disconnect(sender, payload).await;
                        None
                    }
                })
                .await;
        }
    }
}

/// Best-effort local IP: the source address the OS would pick for an
/// outbound datagram. Never sends anything.
pub async fn primary_local_ip() -> String {
    match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => match socket.connect("8.8.8.8:80").await {
            Ok(()) => socket
                .local_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            Err(_) => "127.0.0.1".to_string(),
        },
        Err(_) => "127.0.0.1".to_string(),
    }
}
