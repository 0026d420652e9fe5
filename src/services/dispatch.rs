use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::DeliveryConfig;
use crate::db::models::{
    Channel, DeliveryStatus, Notification, NotificationDelivery, NotificationType, SkipReason,
};
use crate::db::repository::{
    DeliveryRepository, DeviceTokenRepository, NotificationRepository,
    NotificationTypeRepository, UserRepository,
};
use crate::error::AppResult;
use crate::services::email::{EmailMessage, EmailTransport};
use crate::services::preferences::ResolvedPreferences;
use crate::services::push::{PushMessage, PushTransport};
use crate::services::websocket::WebsocketBroadcaster;

/// Provider verdict for one send attempt.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The provider queued the message; confirmation arrives via webhook.
    Accepted { provider_message_id: String },
    /// Worth retrying (timeouts, 5xx, throttling).
    Transient {
        reason: String,
        code: Option<String>,
    },
    /// Retrying can never succeed (bad token, bad address).
    Permanent {
        reason: String,
        code: Option<String>,
    },
}

/// Failure codes that make a delivery permanently failed no matter how many
/// attempts remain. Shared between the senders and the webhook ingestors.
pub const PERMANENT_FAILURE_CODES: [&str; 5] = [
    "unregistered",
    "invalid_token",
    "invalid_email",
    "hard_bounce",
    "invalid_recipient",
];

pub fn is_permanent_code(code: &str) -> bool {
    PERMANENT_FAILURE_CODES.contains(&code)
}

/// Backoff before retry number `attempt` (1-based), exponential with a cap.
pub fn retry_backoff(config: &DeliveryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1);
    let factor = config.backoff_multiplier.saturating_pow(exp);
    let seconds = config
        .initial_backoff_seconds
        .saturating_mul(factor)
        .min(config.max_backoff_seconds);
    Duration::from_secs(seconds)
}

/// Fans one notification out to its channels and drives each delivery
/// through the state machine.
pub struct DeliveryDispatcher {
    pool: SqlitePool,
    config: DeliveryConfig,
    push: Arc<dyn PushTransport>,
    email: Arc<dyn EmailTransport>,
    websocket: Arc<dyn WebsocketBroadcaster>,
}

impl DeliveryDispatcher {
    pub fn new(
        pool: SqlitePool,
        config: DeliveryConfig,
        push: Arc<dyn PushTransport>,
        email: Arc<dyn EmailTransport>,
        websocket: Arc<dyn WebsocketBroadcaster>,
    ) -> Self {
        Self {
            pool,
            config,
            push,
            email,
            websocket,
        }
    }

    /// Create one delivery row per channel and attempt the pending ones.
    /// Re-dispatching the same notification is a no-op per channel:
    /// existing rows are returned untouched.
    pub async fn dispatch(
        &self,
        notification: &Notification,
        ntype: &NotificationType,
        resolved: &ResolvedPreferences,
    ) -> AppResult<Vec<NotificationDelivery>> {
        let mut deliveries = Vec::new();

        for channel in Channel::ALL {
            let skip = if !resolved.allowed {
                // blocked_reason is always set when allowed is false
                Some(resolved.blocked_reason.unwrap_or(SkipReason::TypeDisabled))
            } else if !resolved.channel_enabled(channel) {
                // off because the type does not carry this channel or the
                // user overrode it away
                Some(SkipReason::ChannelDisabled)
            } else {
                self.capability_skip(notification, channel).await?
            };

            let delivery = match skip {
                Some(reason) => {
                    DeliveryRepository::create(
                        &self.pool,
                        &notification.id,
                        channel,
                        DeliveryStatus::Skipped,
                        Some(reason),
                    )
                    .await?
                }
                None => {
                    let delivery = DeliveryRepository::create(
                        &self.pool,
                        &notification.id,
                        channel,
                        DeliveryStatus::Pending,
                        None,
                    )
                    .await?;
                    if delivery.status == DeliveryStatus::Pending {
                        self.process_delivery(&delivery, notification, ntype).await?;
                        DeliveryRepository::find_by_id(&self.pool, &delivery.id)
                            .await?
                            .unwrap_or(delivery)
                    } else {
                        delivery
                    }
                }
            };
            deliveries.push(delivery);
        }

        Ok(deliveries)
    }

    /// Capability checks that can be decided before attempting a send.
    /// Websocket connections are only known at send time, so that check
    /// happens inside the attempt.
    async fn capability_skip(
        &self,
        notification: &Notification,
        channel: Channel,
    ) -> AppResult<Option<SkipReason>> {
        match channel {
            Channel::Push => {
                let tokens =
                    DeviceTokenRepository::find_active_for_user(&self.pool, &notification.recipient_id)
                        .await?;
                Ok(tokens.is_empty().then_some(SkipReason::NoDeviceToken))
            }
            Channel::Email => {
                let user =
                    UserRepository::find_by_id(&self.pool, &notification.recipient_id).await?;
                let has_email = user.and_then(|u| u.email).is_some();
                Ok((!has_email).then_some(SkipReason::NoEmail))
            }
            Channel::Websocket => Ok(None),
        }
    }

    /// Run one send attempt for a pending delivery and apply the resulting
    /// transition.
    pub async fn process_delivery(
        &self,
        delivery: &NotificationDelivery,
        notification: &Notification,
        ntype: &NotificationType,
    ) -> AppResult<()> {
        match delivery.channel {
            Channel::Push => self.attempt_push(delivery, notification).await,
            Channel::Email => self.attempt_email(delivery, notification, ntype).await,
            Channel::Websocket => self.attempt_websocket(delivery, notification, ntype).await,
        }
    }

    async fn attempt_push(
        &self,
        delivery: &NotificationDelivery,
        notification: &Notification,
    ) -> AppResult<()> {
        let tokens =
            DeviceTokenRepository::find_active_for_user(&self.pool, &notification.recipient_id)
                .await?;
        if tokens.is_empty() {
            // Tokens can disappear between dispatch and a later retry.
            self.apply_skip(delivery, SkipReason::NoDeviceToken).await?;
            return Ok(());
        }

        let token_values: Vec<String> = tokens.into_iter().map(|t| t.token).collect();
        let message = PushMessage {
            title: notification.title.clone(),
            body: notification.body.clone(),
            data: notification.data(),
        };
        let outcome = self.push.send(&token_values, &message).await;
        self.apply_outcome(delivery, outcome).await
    }

    async fn attempt_email(
        &self,
        delivery: &NotificationDelivery,
        notification: &Notification,
        ntype: &NotificationType,
    ) -> AppResult<()> {
        let user = UserRepository::find_by_id(&self.pool, &notification.recipient_id).await?;
        let Some(to) = user.and_then(|u| u.email) else {
            self.apply_skip(delivery, SkipReason::NoEmail).await?;
            return Ok(());
        };

        let message = EmailMessage {
            to,
            subject: notification.title.clone(),
            body: notification.body.clone(),
        };
        tracing::debug!(
            "Sending {} email for notification {}",
            ntype.key,
            notification.id
        );
        let outcome = self.email.send(&message).await;
        self.apply_outcome(delivery, outcome).await
    }

    async fn attempt_websocket(
        &self,
        delivery: &NotificationDelivery,
        notification: &Notification,
        ntype: &NotificationType,
    ) -> AppResult<()> {
        let payload = serde_json::json!({
            "id": notification.id,
            "type": ntype.key,
            "title": notification.title,
            "body": notification.body,
            "data": notification.data(),
            "source_kind": notification.source_kind,
            "source_id": notification.source_id,
            "created_at": notification.created_at,
        });

        let result = self
            .websocket
            .broadcast(&notification.recipient_id, &payload)
            .await;

        if result.targeted == 0 {
            self.apply_skip(delivery, SkipReason::NoConnections).await?;
            return Ok(());
        }

        // Local fan-out has no separate provider acknowledgement, so sent
        // and delivered collapse into one transition.
        debug_assert!(delivery.status.can_transition(DeliveryStatus::Delivered));
        let updated = DeliveryRepository::mark_websocket_delivered(
            &self.pool,
            &delivery.id,
            result.targeted,
            result.reached,
        )
        .await?;
        if updated.is_none() {
            tracing::debug!(
                "Delivery {} left pending before websocket broadcast landed, ignoring",
                delivery.id
            );
        }
        Ok(())
    }

    async fn apply_outcome(
        &self,
        delivery: &NotificationDelivery,
        outcome: SendOutcome,
    ) -> AppResult<()> {
        match outcome {
            SendOutcome::Accepted {
                provider_message_id,
            } => {
                debug_assert!(delivery.status.can_transition(DeliveryStatus::Sent));
                let updated =
                    DeliveryRepository::mark_sent(&self.pool, &delivery.id, &provider_message_id)
                        .await?;
                if updated.is_none() {
                    tracing::debug!(
                        "Delivery {} was not pending when send completed, ignoring",
                        delivery.id
                    );
                }
            }
            SendOutcome::Transient { reason, code } => {
                self.fail_attempt(delivery, &reason, code.as_deref(), false)
                    .await?;
            }
            SendOutcome::Permanent { reason, code } => {
                self.fail_attempt(delivery, &reason, code.as_deref(), true)
                    .await?;
            }
        }
        Ok(())
    }

    async fn fail_attempt(
        &self,
        delivery: &NotificationDelivery,
        reason: &str,
        code: Option<&str>,
        permanent: bool,
    ) -> AppResult<()> {
        debug_assert!(delivery.status.can_transition(DeliveryStatus::Failed));
        let attempts_after = delivery.attempt_count + 1;
        let retries_left = !permanent && attempts_after < self.config.max_attempts as i64;
        let next_retry_at = retries_left.then(|| {
            let backoff = retry_backoff(&self.config, attempts_after as u32);
            Utc::now().naive_utc() + chrono::Duration::seconds(backoff.as_secs() as i64)
        });

        let updated = DeliveryRepository::mark_attempt_failed(
            &self.pool,
            &delivery.id,
            reason,
            code,
            permanent,
            next_retry_at,
        )
        .await?;

        match updated {
            Some(d) if d.next_retry_at.is_some() => tracing::info!(
                "Delivery {} failed (attempt {}/{}): {}. Retry scheduled",
                d.id,
                d.attempt_count,
                self.config.max_attempts,
                reason
            ),
            Some(d) => tracing::warn!(
                "Delivery {} failed terminally after {} attempt(s): {}",
                d.id,
                d.attempt_count,
                reason
            ),
            None => tracing::debug!(
                "Delivery {} was not pending when failure landed, ignoring",
                delivery.id
            ),
        }
        Ok(())
    }

    async fn apply_skip(
        &self,
        delivery: &NotificationDelivery,
        reason: SkipReason,
    ) -> AppResult<()> {
        debug_assert!(delivery.status.can_transition(DeliveryStatus::Skipped));
        let updated = DeliveryRepository::mark_skipped(&self.pool, &delivery.id, reason).await?;
        if let Some(d) = updated {
            tracing::info!("Delivery {} skipped: {}", d.id, reason.as_str());
        }
        Ok(())
    }

    /// One retry poll: claim due failed deliveries and re-attempt them.
    /// Returns the number claimed.
    pub async fn run_retry_cycle(&self) -> AppResult<usize> {
        let claimed = DeliveryRepository::claim_due_retries(
            &self.pool,
            self.config.retry_batch_size,
            self.config.max_attempts,
        )
        .await?;
        let count = claimed.len();

        for delivery in claimed {
            let Some(notification) =
                NotificationRepository::find_by_id(&self.pool, &delivery.notification_id).await?
            else {
                tracing::error!(
                    "Delivery {} references missing notification {}",
                    delivery.id,
                    delivery.notification_id
                );
                continue;
            };
            let Some(ntype) =
                NotificationTypeRepository::find_by_id(&self.pool, &notification.type_id).await?
            else {
                tracing::error!(
                    "Notification {} references missing type {}",
                    notification.id,
                    notification.type_id
                );
                continue;
            };

            if let Err(err) = self.process_delivery(&delivery, &notification, &ntype).await {
                tracing::error!("Retry of delivery {} errored: {}", delivery.id, err);
            }
        }

        Ok(count)
    }
}
