//! High-level Kademlia DHT: bootstrap, iterative lookup, announce, and
//! periodic maintenance over the routing table and RPC handler.

use super::distance::{distance, random_id_in_bucket};
use super::endpoint::PeerEndpoint;
use super::routing::{now_secs, DhtNode, RoutingTable};
use super::rpc::{FindValueResult, RpcConfig, RpcHandler};
use crate::config::DhtConfig;
use crate::identity::NodeId;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DhtStatsSnapshot {
    pub bootstraps: u64,
    pub lookups: u64,
    pub announcements: u64,
    pub bucket_refreshes: u64,
    pub routing_nodes: usize,
}

/// Kademlia DHT manager. One per node; shared behind `Arc`.
pub struct DhtManager {
    node_id: NodeId,
    advertise_ip: Mutex<String>,
    advertise_port: u16,
    config: DhtConfig,
    routing: Arc<Mutex<RoutingTable>>,
    rpc: Arc<RpcHandler>,
    seeds: Mutex<Vec<(String, u16)>>,
    announce_value: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    bootstraps: AtomicU64,
    lookups: AtomicU64,
    announcements: AtomicU64,
    bucket_refreshes: AtomicU64,
}

impl DhtManager {
    /// Bind the RPC socket and start the receive + maintenance loops.
    ///
    /// `advertise_ip` is what announce() publishes; a configured port of 0
    /// advertises whatever ephemeral port was bound (tests).
    pub async fn start(
        node_id: NodeId,
        advertise_ip: String,
        config: DhtConfig,
    ) -> std::io::Result<Arc<Self>> {
        let routing = Arc::new(Mutex::new(RoutingTable::new(
            node_id.clone(),
            config.k,
            config.subnet_diversity_limit,
            config.node_stale_secs,
        )));

        let rpc_config = RpcConfig {
            timeout: config.rpc_timeout,
            max_retries: config.rpc_retries,
            max_packet_size: config.max_packet_size,
            rate_limit_per_ip: config.rate_limit_per_ip,
        };
        let rpc = RpcHandler::bind(
            node_id.clone(),
            Arc::clone(&routing),
            rpc_config,
            "0.0.0.0",
            config.port,
        )
        .await?;
        let bound_port = rpc.local_addr()?.port();
        let advertise_port = if config.port == 0 { bound_port } else { config.port };

        let manager = Arc::new(Self {
            node_id: node_id.clone(),
            advertise_ip: Mutex::new(advertise_ip),
            advertise_port,
            config,
            routing,
            rpc,
            seeds: Mutex::new(Vec::new()),
            announce_value: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            bootstraps: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            announcements: AtomicU64::new(0),
            bucket_refreshes: AtomicU64::new(0),
        });

        let rpc_task = manager.rpc.start();
        let maintenance_task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.maintenance_loop().await })
        };
        manager.tasks.lock().await.extend([rpc_task, maintenance_task]);

        info!(
            "DHT manager started: {} advertising {}:{} (k={}, alpha={})",
            node_id.short(),
            manager.advertise_ip.lock().await,
            advertise_port,
            manager.config.k,
            manager.config.alpha
        );
        Ok(manager)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("DHT manager stopped");
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn rpc(&self) -> &Arc<RpcHandler> {
        &self.rpc
    }

    pub fn advertise_port(&self) -> u16 {
        self.advertise_port
    }

    pub async fn set_advertise_ip(&self, ip: String) {
        *self.advertise_ip.lock().await = ip;
    }

    /// Value STOREd under our node id on announce. Defaults to the legacy
    /// `"ip:port"` contact; the P2P manager upgrades it to the serialized
    /// v2.0 endpoint record.
    pub async fn set_announce_value(&self, value: String) {
        *self.announce_value.lock().await = Some(value);
    }

    pub async fn known_peers(&self) -> Vec<DhtNode> {
        self.routing.lock().await.all_nodes()
    }

    pub async fn node_count(&self) -> usize {
        self.routing.lock().await.node_count()
    }

    pub async fn stats(&self) -> DhtStatsSnapshot {
        DhtStatsSnapshot {
            bootstraps: self.bootstraps.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            announcements: self.announcements.load(Ordering::Relaxed),
            bucket_refreshes: self.bucket_refreshes.load(Ordering::Relaxed),
            routing_nodes: self.routing.lock().await.node_count(),
        }
    }

    // ===== Bootstrap =====

    /// PING all seeds concurrently, then self-lookup and a background
    /// refresh of non-empty buckets. True iff any seed answered.
    pub async fn bootstrap(self: &Arc<Self>, seed_nodes: Vec<(String, u16)>) -> bool {
        info!("Starting DHT bootstrap with {} seed nodes", seed_nodes.len());
        self.bootstraps.fetch_add(1, Ordering::Relaxed);
        *self.seeds.lock().await = seed_nodes.clone();

        if seed_nodes.is_empty() {
            warn!("No seed nodes provided for bootstrap");
            return false;
        }

        let pings = seed_nodes
            .iter()
            .map(|(ip, port)| self.rpc.ping(ip, *port));

        let responsive = match tokio::time::timeout(
            Duration::from_secs_f64(self.config.bootstrap_timeout),
            join_all(pings),
        )
        .await
        {
            Ok(results) => results.into_iter().flatten().count(),
            Err(_) => {
                warn!(
                    "Bootstrap PING phase timed out after {:.1}s",
                    self.config.bootstrap_timeout
                );
                0
            }
        };

        if responsive == 0 {
            warn!("Bootstrap failed: no responsive seed nodes");
            return false;
        }
        info!("Bootstrap: {}/{} seed nodes responsive", responsive, seed_nodes.len());

        // Self-lookup populates the buckets nearest to us
        let self_id = self.node_id.clone();
        self.find_node(&self_id).await;

        let manager = Arc::clone(self);
        let refresh = tokio::spawn(async move { manager.refresh_all_buckets().await });
        self.tasks.lock().await.push(refresh);

        info!(
            "Bootstrap completed: {} nodes in routing table",
            self.routing.lock().await.node_count()
        );
        true
    }

    // ===== Iterative lookup =====

    /// Iterative FIND_NODE: alpha-parallel rounds over a shortlist kept
    /// sorted by distance and truncated to k. Terminates on two stalled
    /// rounds, no new nodes, or k responders.
    pub async fn find_node(&self, target: &NodeId) -> Vec<DhtNode> {
        debug!("Starting iterative lookup for {}", target.short());
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let k = self.config.k;
        let mut shortlist = self.routing.lock().await.find_closest(target, k);
        if shortlist.is_empty() {
            warn!("Lookup failed: routing table empty");
            return Vec::new();
        }

        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responded: HashSet<NodeId> = HashSet::new();
        let mut closest_distance = u128::MAX;
        let mut stall_rounds = 0u32;

        loop {
            let candidates: Vec<DhtNode> = shortlist
                .iter()
                .filter(|n| !queried.contains(&n.node_id))
                .take(self.config.alpha)
                .cloned()
                .collect();

            if candidates.is_empty() {
                debug!("Lookup converged: no more candidates to query");
                break;
            }
            for node in &candidates {
                queried.insert(node.node_id.clone());
            }

            let round = candidates
                .iter()
                .map(|n| self.rpc.find_node(&n.ip, n.port, target));
            let results = match tokio::time::timeout(
                Duration::from_secs_f64(self.config.lookup_timeout),
                join_all(round),
            )
            .await
            {
                Ok(results) => results,
                Err(_) => {
                    debug!("Lookup round timed out after {:.1}s", self.config.lookup_timeout);
                    break;
                }
            };

            let mut new_nodes_found = false;
            for (candidate, result) in candidates.iter().zip(results) {
                let Some(nodes) = result else { continue };
                responded.insert(candidate.node_id.clone());

                for node in nodes {
                    if node.node_id == self.node_id {
                        continue;
                    }
                    if !shortlist.iter().any(|n| n.node_id == node.node_id) {
                        shortlist.push(node);
                        new_nodes_found = true;
                    }
                }
            }

            shortlist.sort_by_key(|n| distance(target, &n.node_id));
            shortlist.truncate(k);

            if let Some(first) = shortlist.first() {
                let d = distance(target, &first.node_id);
                if d < closest_distance {
                    closest_distance = d;
                    stall_rounds = 0;
                } else {
                    stall_rounds += 1;
                }
            }

            if stall_rounds >= 2 {
                debug!("Lookup converged: no closer nodes found");
                break;
            }
            if !new_nodes_found {
                debug!("Lookup converged: no new nodes discovered");
                break;
            }
            if responded.len() >= k {
                debug!("Lookup complete: {} nodes responded", responded.len());
                break;
            }
        }

        debug!(
            "Lookup for {} finished: queried {}, responded {}, shortlist {}",
            target.short(),
            queried.len(),
            responded.len(),
            shortlist.len()
        );
        shortlist
    }

    // ===== Announce =====

    /// Publish our contact on the k nodes closest to us. Returns the
    /// number of successful STOREs.
    pub async fn announce(&self) -> usize {
        info!("Announcing node presence to DHT");
        self.announcements.fetch_add(1, Ordering::Relaxed);

        let self_id = self.node_id.clone();
        let closest = self.find_node(&self_id).await;
        if closest.is_empty() {
            warn!("Announce failed: no nodes found");
            return 0;
        }

        let value = match self.announce_value.lock().await.clone() {
            Some(v) => v,
            None => format!("{}:{}", self.advertise_ip.lock().await, self.advertise_port),
        };
        let key = self.node_id.to_string();

        let stores = closest
            .iter()
            .map(|n| self.rpc.store(&n.ip, n.port, &key, &value));
        let success_count = join_all(stores).await.into_iter().filter(|ok| *ok).count();

        info!(
            "Announced to {}/{} nodes (key={})",
            success_count,
            closest.len(),
            self.node_id.short()
        );
        success_count
    }

    /// STORE an arbitrary key on the k nodes closest to `key_owner`
    /// (certificate and relay-descriptor publication).
    pub async fn store_on_closest(&self, key_owner: &NodeId, key: &str, value: &str) -> usize {
        let closest = self.find_node(key_owner).await;
        if closest.is_empty() {
            return 0;
        }
        let stores = closest
            .iter()
            .filter(|n| n.node_id != self.node_id)
            .map(|n| self.rpc.store(&n.ip, n.port, key, value));
        join_all(stores).await.into_iter().filter(|ok| *ok).count()
    }

    /// FIND_VALUE a key across the nodes closest to `key_owner`.
    pub async fn lookup_value(&self, key_owner: &NodeId, key: &str) -> Option<String> {
        let closest = self.find_node(key_owner).await;
        for node in closest {
            if let Some(FindValueResult::Value(value)) =
                self.rpc.find_value(&node.ip, node.port, key).await
            {
                return Some(value);
            }
        }
        None
    }

    // ===== Peer discovery =====

    /// Legacy resolution: the announced `(ip, port)` for a peer.
    pub async fn find_peer(&self, target: &NodeId) -> Option<(String, u16)> {
        info!("Searching for peer {}", target.short());
        let endpoint = self.find_peer_full(target).await?;
        endpoint.primary_ipv4_address().ok()
    }

    /// Full resolution: the decoded endpoint record (v2.0 or legacy).
    pub async fn find_peer_full(&self, target: &NodeId) -> Option<PeerEndpoint> {
        let closest = self.find_node(target).await;
        if closest.is_empty() {
            warn!("Peer search failed: no nodes found");
            return None;
        }

        let key = target.to_string();
        for node in closest {
            let Some(result) = self.rpc.find_value(&node.ip, node.port, &key).await else {
                continue;
            };
            let FindValueResult::Value(value) = result else {
                continue;
            };

            match PeerEndpoint::from_json(&value) {
                Ok(endpoint) => {
                    info!("Found peer {} endpoints via DHT", target.short());
                    return Some(endpoint);
                }
                Err(_) => match PeerEndpoint::from_legacy_string(target.clone(), &value) {
                    Ok(endpoint) => {
                        info!("Found peer {} (legacy contact) via DHT", target.short());
                        return Some(endpoint);
                    }
                    Err(e) => {
                        debug!("Unparseable endpoint value for {}: {}", target.short(), e);
                    }
                },
            }
        }

        warn!("Peer {} not found in DHT", target.short());
        None
    }

    // ===== Maintenance =====

    async fn maintenance_loop(self: Arc<Self>) {
        info!("DHT maintenance loop started");
        let mut last_bucket_refresh = now_secs();
        let mut last_announce = now_secs();
        let mut last_bootstrap_retry = 0.0f64;

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let now = now_secs();

            if self.routing.lock().await.node_count() == 0 && now - last_bootstrap_retry >= 300.0 {
                let seeds = self.seeds.lock().await.clone();
                if !seeds.is_empty() {
                    info!("Routing table empty - retrying bootstrap");
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.bootstrap(seeds).await;
                    });
                    last_bootstrap_retry = now;
                }
            }

            if now - last_bucket_refresh >= self.config.bucket_refresh_interval {
                let manager = Arc::clone(&self);
                tokio::spawn(async move { manager.refresh_stale_buckets().await });
                last_bucket_refresh = now;
            }

            if now - last_announce >= self.config.announce_interval {
                let manager = Arc::clone(&self);
                tokio::spawn(async move {
                    manager.announce().await;
                });
                last_announce = now;
            }
        }
        info!("DHT maintenance loop stopped");
    }

    async fn refresh_stale_buckets(&self) {
        let stale = self
            .routing
            .lock()
            .await
            .buckets_needing_refresh(self.config.bucket_refresh_interval);
        if stale.is_empty() {
            return;
        }

        info!("Refreshing {} stale k-buckets", stale.len());
        self.bucket_refreshes.fetch_add(1, Ordering::Relaxed);

        for idx in stale {
            let target = random_id_in_bucket(&self.node_id, idx);
            self.find_node(&target).await;
        }
    }

    /// Refresh every non-empty bucket, alpha lookups at a time.
    async fn refresh_all_buckets(&self) {
        let buckets = self.routing.lock().await.non_empty_buckets();
        if buckets.is_empty() {
            return;
        }
        info!("Refreshing {} non-empty k-buckets", buckets.len());

        let semaphore = Arc::new(Semaphore::new(self.config.alpha));
        let lookups = buckets.into_iter().map(|idx| {
            let semaphore = Arc::clone(&semaphore);
            let target = random_id_in_bucket(&self.node_id, idx);
            async move {
                let _permit = semaphore.acquire().await;
                self.find_node(&target).await
            }
        });
        join_all(lookups).await;
    }
}
