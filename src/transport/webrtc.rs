//! WebRTC data-channel transport, signaled through the hub.
//!
//! The channel is message-oriented: JSON strings, no length framing.
//! A background keepalive pings every 20 s; ping/pong frames never reach
//! the application.

use super::{ConnectionError, PeerConnection, StrategySlot, Transport};
use crate::config::WebRtcConfig;
use crate::identity::NodeId;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// Name of the single data channel both sides use.
pub const DATA_CHANNEL_LABEL: &str = "dpc-data";

/// Build an RTCPeerConnection from the configured STUN/TURN servers.
pub async fn new_peer_connection(
    config: &WebRtcConfig,
) -> Result<Arc<RTCPeerConnection>, ConnectionError> {
    let mut ice_servers = vec![RTCIceServer {
        urls: config.stun_servers.clone(),
        ..Default::default()
    }];
    for turn in &config.turn_servers {
        let (username, credential) = turn.resolved_credentials();
        ice_servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: username.unwrap_or_default(),
            credential: credential.unwrap_or_default(),
            ..Default::default()
        });
    }

    let api = APIBuilder::new().build();
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
    Ok(Arc::new(pc))
}

pub struct WebRtcPeerConnection {
    node_id: NodeId,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    inbound: Mutex<mpsc::Receiver<Value>>,
    running: Arc<AtomicBool>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    strategy: StrategySlot,
}

impl WebRtcPeerConnection {
    /// Wrap an open data channel. Installs the message handler (with
    /// ping/pong filtering) and starts the keepalive.
    pub fn start(
        node_id: NodeId,
        pc: Arc<RTCPeerConnection>,
        channel: Arc<RTCDataChannel>,
        keepalive_interval: f64,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let running = Arc::new(AtomicBool::new(true));

        {
            let channel_for_pong = Arc::clone(&channel);
            let peer = node_id.short();
            channel.on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                let channel = Arc::clone(&channel_for_pong);
                let peer = peer.clone();
                Box::pin(async move {
                    let Ok(text) = std::str::from_utf8(&msg.data) else {
                        debug!("Non-UTF8 data channel message from {}", peer);
                        return;
                    };
                    let Ok(value) = serde_json::from_str::<Value>(text) else {
                        debug!("Invalid JSON on data channel from {}", peer);
                        return;
                    };

                    // Keepalive traffic never reaches handlers
                    match value.get("type").and_then(Value::as_str) {
                        Some("ping") => {
                            let _ = channel.send_text(json!({"type": "pong"}).to_string()).await;
                        }
                        Some("pong") => {}
                        _ => {
                            let _ = tx.send(value).await;
                        }
                    }
                })
            }));
        }

        let keepalive = {
            let channel = Arc::clone(&channel);
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                let period = Duration::from_secs_f64(keepalive_interval);
                loop {
                    tokio::time::sleep(period).await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    if channel
                        .send_text(json!({"type": "ping"}).to_string())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let connection = Arc::new(Self {
            node_id,
            pc,
            channel,
            inbound: Mutex::new(rx),
            running,
            keepalive_task: Mutex::new(None),
            strategy: StrategySlot::default(),
        });
        if let Ok(mut guard) = connection.keepalive_task.try_lock() {
            *guard = Some(keepalive);
        }

        info!(
            "WebRTC peer connection ready: {} (channel '{}')",
            connection.node_id.short(),
            DATA_CHANNEL_LABEL
        );
        connection
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn transport(&self) -> Transport {
        Transport::HubWebrtc
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
        self.channel
            .send_text(message.to_string())
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
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
        if let Some(task) = self.keepalive_task.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.channel.close().await {
            debug!("Data channel close: {}", e);
        }
        if let Err(e) = self.pc.close().await {
            warn!("Peer connection close: {}", e);
        }
        info!("WebRTC connection closed: {}", self.node_id.short());
    }
}
