//! Connection orchestrator: resolves a peer's endpoints, then walks the
//! strategy list in priority order under an overall deadline.

use super::{ConnectionStrategy, StrategyContext, StrategyError};
use crate::identity::NodeId;
use crate::transport::{PeerConnection, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("peer {0} not announced in DHT")]
    NotAnnounced(String),

    #[error("all connection strategies failed for {node_id} (last: {last_strategy}: {last_error})")]
    Exhausted {
        node_id: String,
        last_strategy: String,
        last_error: String,
    },
}

/// One attempt within a connect call, for diagnostics.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub strategy: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub total_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub strategy_usage: HashMap<String, u64>,
    pub active_strategies: Vec<String>,
    pub last_attempts: Vec<AttemptRecord>,
}

pub struct ConnectionOrchestrator {
    ctx: StrategyContext,
    strategies: Mutex<Vec<Arc<dyn ConnectionStrategy>>>,
    overall_timeout: f64,
    stats: Mutex<OrchestratorStats>,
}

impl ConnectionOrchestrator {
    pub fn new(
        ctx: StrategyContext,
        mut strategies: Vec<Arc<dyn ConnectionStrategy>>,
        overall_timeout: f64,
    ) -> Arc<Self> {
        strategies.sort_by_key(|s| s.priority());
        info!(
            "ConnectionOrchestrator initialized with {} strategies",
            strategies.len()
        );
        Arc::new(Self {
            ctx,
            strategies: Mutex::new(strategies),
            overall_timeout,
            stats: Mutex::new(OrchestratorStats::default()),
        })
    }

    pub async fn add_strategy(&self, strategy: Arc<dyn ConnectionStrategy>) {
        let mut strategies = self.strategies.lock().await;
        info!(
            "Added strategy {} (priority={})",
            strategy.name(),
            strategy.priority()
        );
        strategies.push(strategy);
        strategies.sort_by_key(|s| s.priority());
    }

    pub async fn remove_strategy(&self, name: &str) {
        let mut strategies = self.strategies.lock().await;
        strategies.retain(|s| s.name() != name);
        info!("Removed strategy {}", name);
    }

    /// Look up the peer's endpoints and iterate strategies until one
    /// yields a connection or everything is exhausted.
    pub async fn connect(
        &self,
        node_id: &NodeId,
        overall_timeout: Option<f64>,
    ) -> Result<Arc<dyn PeerConnection>, OrchestratorError> {
        let overall = overall_timeout.unwrap_or(self.overall_timeout);
        self.stats.lock().await.total_attempts += 1;
        info!("Connecting to {} (timeout={:.0}s)", node_id.short(), overall);

        let endpoints = match self.ctx.dht.find_peer_full(node_id).await {
            Some(endpoints) => endpoints,
            None => {
                warn!("Peer {} not found in DHT", node_id.short());
                self.stats.lock().await.failed_connections += 1;
                return Err(OrchestratorError::NotAnnounced(node_id.to_string()));
            }
        };
        info!(
            "Found peer {} endpoints (ipv6={}, relay={}, punch={})",
            node_id.short(),
            endpoints.has_ipv6(),
            endpoints.supports_relay(),
            endpoints.supports_hole_punching()
        );

        let strategies = self.strategies.lock().await.clone();
        let start = Instant::now();
        let mut last_strategy = String::from("none");
        let mut last_error = String::from("no applicable strategy");
        let mut attempts = Vec::new();

        for strategy in &strategies {
            let remaining = overall - start.elapsed().as_secs_f64();
            if remaining <= 0.0 {
                warn!("Overall connection timeout exceeded for {}", node_id.short());
                break;
            }

            if !strategy.is_applicable(&endpoints, &self.ctx) {
                debug!(
                    "Strategy {} not applicable for {}",
                    strategy.name(),
                    node_id.short()
                );
                continue;
            }

            let budget = strategy.timeout().min(remaining);
            info!(
                "Trying strategy {} (priority={}, timeout={:.1}s)",
                strategy.name(),
                strategy.priority(),
                budget
            );

            let attempt = tokio::time::timeout(
                Duration::from_secs_f64(budget),
                strategy.connect(node_id, &endpoints, &self.ctx),
            )
            .await;

            match attempt {
                Ok(Ok(connection)) => {
                    info!("Connected to {} via {}", node_id.short(), strategy.name());
                    connection.set_strategy_used(strategy.name());
                    self.register(node_id, &connection).await;

                    let mut stats = self.stats.lock().await;
                    stats.successful_connections += 1;
                    *stats
                        .strategy_usage
                        .entry(strategy.name().to_string())
                        .or_insert(0) += 1;
                    attempts.push(AttemptRecord {
                        strategy: strategy.name().to_string(),
                        outcome: "success".into(),
                    });
                    stats.last_attempts = attempts;
                    return Ok(connection);
                }
                Ok(Err(StrategyError::NotApplicable(reason))) => {
                    debug!("Strategy {} not applicable: {}", strategy.name(), reason);
                    attempts.push(AttemptRecord {
                        strategy: strategy.name().to_string(),
                        outcome: format!("not applicable: {reason}"),
                    });
                }
                Ok(Err(e)) => {
                    warn!(
                        "Strategy {} failed for {}: {}",
                        strategy.name(),
                        node_id.short(),
                        e
                    );
                    last_strategy = strategy.name().to_string();
                    last_error = e.to_string();
                    attempts.push(AttemptRecord {
                        strategy: strategy.name().to_string(),
                        outcome: last_error.clone(),
                    });
                }
                Err(_) => {
                    warn!(
                        "Strategy {} timeout for {}",
                        strategy.name(),
                        node_id.short()
                    );
                    last_strategy = strategy.name().to_string();
                    last_error = "timeout".to_string();
                    attempts.push(AttemptRecord {
                        strategy: strategy.name().to_string(),
                        outcome: "timeout".into(),
                    });
                }
            }
        }

        warn!("All strategies exhausted for {}", node_id.short());
        let mut stats = self.stats.lock().await;
        stats.failed_connections += 1;
        stats.last_attempts = attempts;
        Err(OrchestratorError::Exhausted {
            node_id: node_id.to_string(),
            last_strategy,
            last_error,
        })
    }

    /// Put the winning connection into the P2P registry. Direct-TLS and
    /// WebRTC strategies registered already; punch and relay connections
    /// get a listener task here, the virtual gossip connection only an
    /// entry.
    async fn register(&self, node_id: &NodeId, connection: &Arc<dyn PeerConnection>) {
        if self.ctx.p2p.is_connected(node_id).await {
            return;
        }
        match connection.transport() {
            Transport::Gossip => {
                self.ctx
                    .p2p
                    .register_virtual_connection(node_id.clone(), Arc::clone(connection))
                    .await;
            }
            _ => {
                self.ctx
                    .p2p
                    .register_connection(node_id.clone(), Arc::clone(connection))
                    .await;
            }
        }
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let mut stats = self.stats.lock().await.clone();
        stats.active_strategies = self
            .strategies
            .lock()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        stats
    }
}
