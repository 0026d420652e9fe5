use async_trait::async_trait;
use uuid::Uuid;

use crate::services::dispatch::SendOutcome;

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Boundary to the email provider (ESP). Acceptance here only means the
/// provider queued the message; bounces come back through the webhook.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> SendOutcome;
}

/// Accept-everything transport for tests and local runs.
#[derive(Default)]
pub struct StubEmailTransport;

#[async_trait]
impl EmailTransport for StubEmailTransport {
    async fn send(&self, message: &EmailMessage) -> SendOutcome {
        let provider_message_id = format!("email-{}", Uuid::new_v4());
        tracing::debug!(
            "Email accepted for {}, subject '{}', provider id {}",
            message.to,
            message.subject,
            provider_message_id
        );
        SendOutcome::Accepted {
            provider_message_id,
        }
    }
}
