pub mod config;
pub mod crypto;
pub mod dht;
pub mod gossip;
pub mod hub;
pub mod identity;
pub mod p2p;
pub mod peer_cache;
pub mod punch;
pub mod relay;
pub mod router;
pub mod strategy;
pub mod transport;
pub mod wiring;

pub use config::Config;
pub use dht::{DhtManager, PeerEndpoint};
pub use gossip::{GossipManager, GossipMessage, VectorClock};
pub use hub::{HubClient, Signal};
pub use identity::{NodeId, NodeIdentity};
pub use p2p::{P2pError, P2pManager};
pub use peer_cache::{CachedPeer, PeerCache};
pub use punch::HolePunchManager;
pub use relay::{RelayDescriptor, RelayManager};
pub use router::MessageRouter;
pub use strategy::{ConnectionOrchestrator, ConnectionStrategy, StrategyContext, StrategyError};
pub use transport::{PeerConnection, Transport};
pub use wiring::Node;
