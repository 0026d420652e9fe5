use async_trait::async_trait;
use uuid::Uuid;

use crate::services::dispatch::SendOutcome;

/// Push payload handed to the transport, already rendered and flattened.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Boundary to the push provider. The engine only needs an accept/reject
/// verdict and a provider message id to correlate later webhook callbacks.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, tokens: &[String], message: &PushMessage) -> SendOutcome;
}

/// Transport that accepts everything. Stands in for the real provider in
/// tests and local runs; delivery confirmation then arrives via the
/// webhook endpoint like in production.
#[derive(Default)]
pub struct StubPushTransport;

#[async_trait]
impl PushTransport for StubPushTransport {
    async fn send(&self, tokens: &[String], message: &PushMessage) -> SendOutcome {
        let provider_message_id = format!("fcm-{}", Uuid::new_v4());
        tracing::debug!(
            "Push accepted for {} device(s), title '{}', provider id {}",
            tokens.len(),
            message.title,
            provider_message_id
        );
        SendOutcome::Accepted {
            provider_message_id,
        }
    }
}
