//! Relayed peer connection: application messages wrapped as RELAY_MESSAGE
//! frames through a volunteer relay's TLS connection.
//!
//! The relay observes peer IDs, session IDs, sizes and timing only; the
//! inner message stays opaque to it.

use super::{ConnectionError, PeerConnection, StrategySlot, Transport};
use crate::identity::NodeId;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct RelayedPeerConnection {
    self_id: NodeId,
    peer_id: NodeId,
    relay_id: NodeId,
    session_id: String,
    relay_conn: Arc<dyn PeerConnection>,
    inbound: Mutex<mpsc::Receiver<Value>>,
    running: Arc<AtomicBool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    strategy: StrategySlot,
}

impl RelayedPeerConnection {
    /// Wrap an established relay session. Spawns the receive loop that
    /// filters RELAY_MESSAGE frames belonging to this session.
    pub fn start(
        self_id: NodeId,
        peer_id: NodeId,
        relay_id: NodeId,
        session_id: String,
        relay_conn: Arc<dyn PeerConnection>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let running = Arc::new(AtomicBool::new(true));

        let connection = Arc::new(Self {
            self_id,
            peer_id: peer_id.clone(),
            relay_id,
            session_id: session_id.clone(),
            relay_conn: Arc::clone(&relay_conn),
            inbound: Mutex::new(rx),
            running: Arc::clone(&running),
            receive_task: Mutex::new(None),
            strategy: StrategySlot::default(),
        });

        let task = {
            let relay_conn = Arc::clone(&relay_conn);
            let running = Arc::clone(&running);
            let expected_peer = peer_id.clone();
            let expected_session = session_id;
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    let frame = match relay_conn.read().await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Relay receive loop error: {}", e);
                            break;
                        }
                    };

                    match frame.get("command").and_then(Value::as_str) {
                        Some("RELAY_MESSAGE") => {
                            let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
                            let session_ok = payload.get("session_id").and_then(Value::as_str)
                                == Some(expected_session.as_str());
                            let from_ok = payload
                                .get("from")
                                .and_then(Value::as_str)
                                .map(|f| f == expected_peer.to_string())
                                .unwrap_or(false);

                            if session_ok && from_ok {
                                if let Some(inner) = payload.get("message") {
                                    if tx.send(inner.clone()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some("RELAY_DISCONNECT") => {
                            info!("Relay session ended by peer or relay");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                        Some(other) => {
                            debug!("Ignoring {} frame on relay connection", other);
                        }
                        None => {}
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
        };

        if let Ok(mut guard) = connection.receive_task.try_lock() {
            *guard = Some(task);
        }

        info!(
            "RelayedPeerConnection started: peer={} session={}",
            connection.peer_id.short(),
            connection.session_id
        );
        connection
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn relay_id(&self) -> &NodeId {
        &self.relay_id
    }
}

#[async_trait]
impl PeerConnection for RelayedPeerConnection {
    fn node_id(&self) -> &NodeId {
        &self.peer_id
    }

    fn transport(&self) -> Transport {
        Transport::Relayed
    }

    fn strategy_used(&self) -> Option<String> {
        self.strategy.get()
    }

    fn set_strategy_used(&self, strategy: &str) {
        self.strategy.set(strategy);
    }

    async fn send(&self, message: &Value) -> Result<(), ConnectionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotRunning);
        }

        let frame = json!({
            "command": "RELAY_MESSAGE",
            "payload": {
                "from": self.self_id,
                "to": self.peer_id,
                "session_id": self.session_id,
                "message": message,
            }
        });
        self.relay_conn.send(&frame).await
    }

    async fn read(&self) -> Result<Option<Value>, ConnectionError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let disconnect = json!({
            "command": "RELAY_DISCONNECT",
            "payload": {
                "peer": self.peer_id,
                "session_id": self.session_id,
                "reason": "connection_closed",
            }
        });
        if let Err(e) = self.relay_conn.send(&disconnect).await {
            debug!("Failed to send RELAY_DISCONNECT: {}", e);
        }

        if let Some(task) = self.receive_task.lock().await.take() {
            task.abort();
        }
        self.relay_conn.close().await;
        info!(
            "RelayedPeerConnection closed: peer={} session={}",
            self.peer_id.short(),
            self.session_id
        );
    }
}
