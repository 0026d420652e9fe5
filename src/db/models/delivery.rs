use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Independent delivery pathway for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Websocket,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Push, Channel::Email, Channel::Websocket];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Websocket => "websocket",
        }
    }
}

/// Lifecycle of a delivery record.
///
/// pending -> {sent, failed, skipped}
/// sent    -> {delivered, failed}
/// failed  -> pending (retry, while retryable) or terminal
/// delivered / skipped are always terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    pub fn can_transition(self, to: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, to),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Pending, Delivered) // websocket collapses sent+delivered
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Failed, Pending)
        )
    }
}

/// Why a delivery was skipped (or a resolution blocked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SkipReason {
    GlobalDisabled,
    CategoryDisabled,
    TypeDisabled,
    ChannelDisabled,
    NoDeviceToken,
    NoEmail,
    NoConnections,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::GlobalDisabled => "global_disabled",
            SkipReason::CategoryDisabled => "category_disabled",
            SkipReason::TypeDisabled => "type_disabled",
            SkipReason::ChannelDisabled => "channel_disabled",
            SkipReason::NoDeviceToken => "no_device_token",
            SkipReason::NoEmail => "no_email",
            SkipReason::NoConnections => "no_connections",
        }
    }
}

/// Tracks one channel's attempt to deliver one notification.
///
/// Append-only audit trail: rows are created by the dispatcher and mutated
/// only through guarded status transitions; never deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub id: String,
    pub notification_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,

    pub sent_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub failed_at: Option<NaiveDateTime>,

    /// Provider-side id used to correlate webhook callbacks.
    pub provider_message_id: Option<String>,

    pub failure_reason: Option<String>,
    pub failure_code: Option<String>,
    pub is_permanent_failure: bool,

    /// Incremented on every sender-initiated attempt, never by webhooks.
    pub attempt_count: i64,

    /// When a transiently failed delivery becomes eligible for retry.
    pub next_retry_at: Option<NaiveDateTime>,

    pub skipped_reason: Option<SkipReason>,

    /// Websocket only: connection counts at broadcast time.
    pub devices_targeted: i64,
    pub devices_reached: i64,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NotificationDelivery {
    /// Terminal deliveries ignore all further transition attempts.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.status {
            DeliveryStatus::Delivered | DeliveryStatus::Skipped => true,
            DeliveryStatus::Failed => {
                self.is_permanent_failure || self.attempt_count >= max_attempts as i64
            }
            DeliveryStatus::Pending | DeliveryStatus::Sent => false,
        }
    }

    /// Whether the retry worker may re-queue this delivery.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == DeliveryStatus::Failed
            && !self.is_permanent_failure
            && self.attempt_count < max_attempts as i64
    }
}
