use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Result of pushing one payload to a user's live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Connections registered for the user at broadcast time.
    pub targeted: i64,
    /// Connections the payload was actually handed to.
    pub reached: i64,
}

/// Fan-out to a user's live websocket connections. Zero connections is not
/// an error; the dispatcher records it as a skip.
#[async_trait]
pub trait WebsocketBroadcaster: Send + Sync {
    async fn broadcast(&self, user_id: &str, payload: &serde_json::Value) -> BroadcastResult;
}

type ConnectionSender = mpsc::UnboundedSender<serde_json::Value>;

/// In-process connection registry. Connection handlers register a sender on
/// open and unregister on close; broadcast walks the user's senders and
/// prunes any that went away without unregistering.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, HashMap<String, ConnectionSender>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the id to unregister with.
    pub async fn register(&self, user_id: &str, sender: ConnectionSender) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let mut connections = self.connections.write().await;
        connections
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.clone(), sender);
        connection_id
    }

    pub async fn unregister(&self, user_id: &str, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(user_connections) = connections.get_mut(user_id) {
            user_connections.remove(connection_id);
            if user_connections.is_empty() {
                connections.remove(user_id);
            }
        }
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        let connections = self.connections.read().await;
        connections.get(user_id).map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WebsocketBroadcaster for ConnectionRegistry {
    async fn broadcast(&self, user_id: &str, payload: &serde_json::Value) -> BroadcastResult {
        let mut connections = self.connections.write().await;
        let Some(user_connections) = connections.get_mut(user_id) else {
            return BroadcastResult {
                targeted: 0,
                reached: 0,
            };
        };

        let targeted = user_connections.len() as i64;
        let mut reached = 0;
        user_connections.retain(|_, sender| match sender.send(payload.clone()) {
            Ok(()) => {
                reached += 1;
                true
            }
            // Receiver dropped without unregistering.
            Err(_) => false,
        });
        if user_connections.is_empty() {
            connections.remove(user_id);
        }

        BroadcastResult { targeted, reached }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_counts_targeted_and_reached() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        registry.register("u1", tx1).await;
        registry.register("u1", tx2).await;
        drop(rx2); // second connection went away uncleanly

        let result = registry
            .broadcast("u1", &serde_json::json!({"title": "hi"}))
            .await;
        assert_eq!(result.targeted, 2);
        assert_eq!(result.reached, 1);
        assert!(rx1.recv().await.is_some());

        // Dead connection was pruned during broadcast.
        assert_eq!(registry.connection_count("u1").await, 1);
    }

    #[tokio::test]
    async fn broadcast_with_no_connections_is_zero_zero() {
        let registry = ConnectionRegistry::new();
        let result = registry.broadcast("nobody", &serde_json::json!({})).await;
        assert_eq!(result.targeted, 0);
        assert_eq!(result.reached, 0);
    }

    #[tokio::test]
    async fn unregister_removes_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register("u1", tx).await;
        assert_eq!(registry.connection_count("u1").await, 1);
        registry.unregister("u1", &id).await;
        assert_eq!(registry.connection_count("u1").await, 0);
    }
}
