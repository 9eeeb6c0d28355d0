//! Message router: dispatches decoded P2P messages to handlers by
//! command name.
//!
//! The core registers handlers for its own commands (gossip, relay); all
//! other commands pass through to whatever the application registered.

use crate::identity::NodeId;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;
pub type Handler = Arc<dyn Fn(NodeId, Value) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command name, replacing any existing one.
    pub async fn register<F, Fut>(&self, command: &str, handler: F)
    where
        F: Fn(NodeId, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(command) {
            warn!("Overwriting handler for {}", command);
        }
        handlers.insert(
            command.to_string(),
            Arc::new(move |sender, payload| Box::pin(handler(sender, payload))),
        );
        debug!("Registered handler for {}", command);
    }

    pub async fn unregister(&self, command: &str) {
        if self.handlers.write().await.remove(command).is_some() {
            debug!("Unregistered handler for {}", command);
        }
    }

    /// Dispatch a decoded message. Returns whatever the handler produced
    /// (request/response patterns); unknown commands log at warn.
    pub async fn route(&self, sender: NodeId, message: &Value) -> Option<Value> {
        let Some(command) = message.get("command").and_then(Value::as_str) else {
            warn!("Message without command from {}", sender.short());
            return None;
        };

        let handler = self.handlers.read().await.get(command).cloned();
        let Some(handler) = handler else {
            warn!("Unknown P2P message command: {}", command);
            return None;
        };

        let payload = message
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        debug!("Routing {} message from {}", command, sender.short());
        handler(sender, payload).await
    }

    pub async fn registered_commands(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_route_to_handler() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&hits);
        router
            .register("PING_ME", move |_sender, payload| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Some(json!({"echo": payload}))
                }
            })
            .await;

        let reply = router
            .route(
                NodeId::from_value(1),
                &json!({"command": "PING_ME", "payload": {"x": 1}}),
            )
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reply.unwrap()["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_command_returns_none() {
        let router = MessageRouter::new();
        let reply = router
            .route(NodeId::from_value(1), &json!({"command": "NOPE"}))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_unregister() {
        let router = MessageRouter::new();
        router.register("X", |_, _| async { None }).await;
        assert_eq!(router.registered_commands().await, vec!["X".to_string()]);
        router.unregister("X").await;
        assert!(router.registered_commands().await.is_empty());
    }
}
