//! Kademlia DHT: XOR key space, routing table, UDP RPC, and the manager
//! that ties bootstrap, lookup, announce, and maintenance together.

pub mod distance;
pub mod endpoint;
pub mod manager;
pub mod routing;
pub mod rpc;

// Re-exports
pub use distance::{bucket_index, distance, is_closer, random_id_in_bucket, sort_by_distance};
pub use endpoint::{
    split_host_port, EndpointError, Ipv4Info, Ipv6Info, NatType, PeerEndpoint, PunchInfo,
    RelayInfo,
};
pub use manager::{DhtManager, DhtStatsSnapshot};
pub use routing::{now_secs, DhtNode, KBucket, RoutingError, RoutingStats, RoutingTable};
pub use rpc::{FindValueResult, NodeContact, RpcConfig, RpcHandler, RpcStatsSnapshot};
