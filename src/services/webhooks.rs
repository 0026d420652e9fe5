use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::SqlitePool;

use crate::config::DeliveryConfig;
use crate::db::models::NotificationDelivery;
use crate::db::repository::{DeliveryRepository, DeviceTokenRepository};
use crate::error::AppResult;
use crate::services::dispatch::{is_permanent_code, retry_backoff};

type HmacSha256 = Hmac<Sha256>;

/// Verify a hex-encoded HMAC-SHA256 signature over the raw request body.
/// Comparison happens inside the mac (constant time).
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Status callback from the push provider.
#[derive(Debug, Clone, Deserialize)]
pub struct PushWebhookEvent {
    pub message_id: String,
    /// "delivered" or "failed".
    pub event: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Device token the event applies to, when the provider includes it.
    #[serde(default)]
    pub token: Option<String>,
}

/// Status callback from the email provider.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailWebhookEvent {
    pub message_id: String,
    /// "delivered", "bounced", "complained" or "dropped".
    pub event: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What ingesting one event did. Webhooks always answer 200 for verified
/// payloads; this only drives logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// No delivery carries this provider message id.
    UnknownMessage,
    /// The delivery was not in a state this event can transition.
    Stale,
    /// Event name we do not understand.
    UnknownEvent,
}

pub async fn ingest_push_event(
    pool: &SqlitePool,
    config: &DeliveryConfig,
    event: PushWebhookEvent,
) -> AppResult<IngestOutcome> {
    let Some(delivery) =
        DeliveryRepository::find_by_provider_message_id(pool, &event.message_id).await?
    else {
        tracing::warn!(
            "Push webhook for unknown provider message id {}, ignoring",
            event.message_id
        );
        return Ok(IngestOutcome::UnknownMessage);
    };
    if delivery.is_terminal(config.max_attempts) {
        tracing::debug!(
            "Push webhook event '{}' for terminal delivery {}, ignoring",
            event.event,
            delivery.id
        );
        return Ok(IngestOutcome::Stale);
    }

    match event.event.as_str() {
        "delivered" => {
            let updated = DeliveryRepository::mark_delivered(pool, &delivery.id).await?;
            Ok(applied_or_stale(updated.is_some(), &delivery.id, "delivered"))
        }
        "failed" => {
            let code = event.error_code.as_deref();
            let permanent = code.map(is_permanent_code).unwrap_or(false);
            let reason = event
                .reason
                .as_deref()
                .unwrap_or("push provider reported failure");
            let updated = bounce(pool, config, &delivery, reason, code, permanent).await?;

            // A dead token poisons every later send, drop it now.
            if permanent {
                if let Some(token) = &event.token {
                    if DeviceTokenRepository::deactivate_by_token(pool, token).await? {
                        tracing::info!(
                            "Deactivated device token after permanent push failure ({})",
                            code.unwrap_or("unknown")
                        );
                    }
                }
            }
            Ok(applied_or_stale(updated.is_some(), &delivery.id, "failed"))
        }
        other => {
            tracing::warn!("Unknown push webhook event '{}', ignoring", other);
            Ok(IngestOutcome::UnknownEvent)
        }
    }
}

pub async fn ingest_email_event(
    pool: &SqlitePool,
    config: &DeliveryConfig,
    event: EmailWebhookEvent,
) -> AppResult<IngestOutcome> {
    let Some(delivery) =
        DeliveryRepository::find_by_provider_message_id(pool, &event.message_id).await?
    else {
        tracing::warn!(
            "Email webhook for unknown provider message id {}, ignoring",
            event.message_id
        );
        return Ok(IngestOutcome::UnknownMessage);
    };
    if delivery.is_terminal(config.max_attempts) {
        tracing::debug!(
            "Email webhook event '{}' for terminal delivery {}, ignoring",
            event.event,
            delivery.id
        );
        return Ok(IngestOutcome::Stale);
    }

    match event.event.as_str() {
        "delivered" => {
            let updated = DeliveryRepository::mark_delivered(pool, &delivery.id).await?;
            Ok(applied_or_stale(updated.is_some(), &delivery.id, "delivered"))
        }
        failure @ ("bounced" | "complained" | "dropped") => {
            let code = event.error_code.as_deref();
            // A spam complaint suppresses the address regardless of code.
            let permanent = failure == "complained" || code.map(is_permanent_code).unwrap_or(false);
            let reason = event.reason.clone().unwrap_or_else(|| {
                format!("email provider reported {failure}")
            });
            let updated = bounce(pool, config, &delivery, &reason, code, permanent).await?;
            Ok(applied_or_stale(updated.is_some(), &delivery.id, failure))
        }
        other => {
            tracing::warn!("Unknown email webhook event '{}', ignoring", other);
            Ok(IngestOutcome::UnknownEvent)
        }
    }
}

/// Apply a provider-reported bounce, scheduling a retry when the failure is
/// transient and attempts remain. The attempt already counted at send time,
/// so the backoff indexes on the current attempt count.
async fn bounce(
    pool: &SqlitePool,
    config: &DeliveryConfig,
    delivery: &NotificationDelivery,
    reason: &str,
    code: Option<&str>,
    permanent: bool,
) -> AppResult<Option<NotificationDelivery>> {
    let retries_left = !permanent && delivery.attempt_count < config.max_attempts as i64;
    let next_retry_at = retries_left.then(|| {
        let backoff = retry_backoff(config, delivery.attempt_count.max(1) as u32);
        Utc::now().naive_utc() + chrono::Duration::seconds(backoff.as_secs() as i64)
    });
    let updated =
        DeliveryRepository::mark_bounced(pool, &delivery.id, reason, code, permanent, next_retry_at)
            .await?;
    if let Some(d) = &updated {
        debug_assert_eq!(d.next_retry_at.is_some(), d.is_retryable(config.max_attempts));
    }
    Ok(updated)
}

fn applied_or_stale(applied: bool, delivery_id: &str, event: &str) -> IngestOutcome {
    if applied {
        IngestOutcome::Applied
    } else {
        tracing::debug!(
            "Webhook event '{}' for delivery {} arrived out of order, ignoring",
            event,
            delivery_id
        );
        IngestOutcome::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compute the signature a caller would send.
    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_roundtrip() {
        let secret = "whsec_test";
        let body = br#"{"message_id":"fcm-1","event":"delivered"}"#;
        let signature = sign(secret, body);
        assert!(verify_signature(secret, body, &signature));
        assert!(verify_signature(secret, body, &format!("  {signature} ")));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = "whsec_test";
        let signature = sign(secret, b"original");
        assert!(!verify_signature(secret, b"tampered", &signature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let signature = sign("secret-a", b"body");
        assert!(!verify_signature("secret-b", b"body", &signature));
    }

    #[test]
    fn malformed_hex_fails_verification() {
        assert!(!verify_signature("secret", b"body", "not-hex"));
        assert!(!verify_signature("secret", b"body", ""));
    }

    mod ingest {
        use super::*;
        use crate::db::models::{Channel, DeliveryStatus, NotificationDelivery};
        use crate::db::test_support::{
            seed_device, seed_notification, seed_type, seed_user, setup_pool,
        };

        fn config() -> DeliveryConfig {
            crate::config::Config::default().delivery
        }

        async fn seed_sent_delivery(pool: &SqlitePool, provider_id: &str) -> NotificationDelivery {
            seed_user(pool, "u1", Some("u1@example.com")).await;
            seed_device(pool, "u1", "phone-1", "tok-1").await;
            let ntype = seed_type(pool, "order_shipped").await;
            let notification = seed_notification(pool, "u1", &ntype.id).await;
            let delivery = DeliveryRepository::create(
                pool,
                &notification.id,
                Channel::Push,
                DeliveryStatus::Pending,
                None,
            )
            .await
            .unwrap();
            DeliveryRepository::mark_sent(pool, &delivery.id, provider_id)
                .await
                .unwrap()
                .unwrap()
        }

        #[tokio::test]
        async fn delivered_event_confirms_delivery() {
            let pool = setup_pool().await;
            let delivery = seed_sent_delivery(&pool, "fcm-1").await;

            let outcome = ingest_push_event(
                &pool,
                &config(),
                PushWebhookEvent {
                    message_id: "fcm-1".to_string(),
                    event: "delivered".to_string(),
                    error_code: None,
                    reason: None,
                    token: None,
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::Applied);

            let updated = DeliveryRepository::find_by_id(&pool, &delivery.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.status, DeliveryStatus::Delivered);
            // Webhook transitions never count as attempts.
            assert_eq!(updated.attempt_count, delivery.attempt_count);
        }

        #[tokio::test]
        async fn unknown_message_id_is_ignored() {
            let pool = setup_pool().await;
            let outcome = ingest_push_event(
                &pool,
                &config(),
                PushWebhookEvent {
                    message_id: "fcm-ghost".to_string(),
                    event: "delivered".to_string(),
                    error_code: None,
                    reason: None,
                    token: None,
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::UnknownMessage);
        }

        #[tokio::test]
        async fn duplicate_delivered_event_is_stale() {
            let pool = setup_pool().await;
            seed_sent_delivery(&pool, "fcm-1").await;
            let event = PushWebhookEvent {
                message_id: "fcm-1".to_string(),
                event: "delivered".to_string(),
                error_code: None,
                reason: None,
                token: None,
            };

            assert_eq!(
                ingest_push_event(&pool, &config(), event.clone()).await.unwrap(),
                IngestOutcome::Applied
            );
            assert_eq!(
                ingest_push_event(&pool, &config(), event).await.unwrap(),
                IngestOutcome::Stale
            );
        }

        #[tokio::test]
        async fn permanent_push_failure_deactivates_token() {
            let pool = setup_pool().await;
            let delivery = seed_sent_delivery(&pool, "fcm-1").await;

            let outcome = ingest_push_event(
                &pool,
                &config(),
                PushWebhookEvent {
                    message_id: "fcm-1".to_string(),
                    event: "failed".to_string(),
                    error_code: Some("unregistered".to_string()),
                    reason: Some("token no longer registered".to_string()),
                    token: Some("tok-1".to_string()),
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::Applied);

            let updated = DeliveryRepository::find_by_id(&pool, &delivery.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.status, DeliveryStatus::Failed);
            assert!(updated.is_permanent_failure);

            let devices = DeviceTokenRepository::find_active_for_user(&pool, "u1")
                .await
                .unwrap();
            assert!(devices.is_empty());
        }

        #[tokio::test]
        async fn email_bounce_and_complaint_mapping() {
            let pool = setup_pool().await;
            let delivery = seed_sent_delivery(&pool, "email-1").await;

            // Soft bounce: failed but retryable from the engine's viewpoint.
            let outcome = ingest_email_event(
                &pool,
                &config(),
                EmailWebhookEvent {
                    message_id: "email-1".to_string(),
                    event: "bounced".to_string(),
                    error_code: None,
                    reason: Some("mailbox full".to_string()),
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::Applied);
            let updated = DeliveryRepository::find_by_id(&pool, &delivery.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.status, DeliveryStatus::Failed);
            assert!(!updated.is_permanent_failure);
            assert!(updated.next_retry_at.is_some());

            // Hard bounce on another delivery is permanent.
            let pool2 = setup_pool().await;
            let hard = seed_sent_delivery(&pool2, "email-2").await;
            ingest_email_event(
                &pool2,
                &config(),
                EmailWebhookEvent {
                    message_id: "email-2".to_string(),
                    event: "bounced".to_string(),
                    error_code: Some("hard_bounce".to_string()),
                    reason: None,
                },
            )
            .await
            .unwrap();
            let updated = DeliveryRepository::find_by_id(&pool2, &hard.id)
                .await
                .unwrap()
                .unwrap();
            assert!(updated.is_permanent_failure);
            assert!(updated.next_retry_at.is_none());

            // Complaints are permanent regardless of code.
            let pool3 = setup_pool().await;
            let complaint = seed_sent_delivery(&pool3, "email-3").await;
            ingest_email_event(
                &pool3,
                &config(),
                EmailWebhookEvent {
                    message_id: "email-3".to_string(),
                    event: "complained".to_string(),
                    error_code: None,
                    reason: None,
                },
            )
            .await
            .unwrap();
            let updated = DeliveryRepository::find_by_id(&pool3, &complaint.id)
                .await
                .unwrap()
                .unwrap();
            assert!(updated.is_permanent_failure);
        }

        #[tokio::test]
        async fn soft_bounce_is_rescheduled_for_retry() {
            let pool = setup_pool().await;
            let delivery = seed_sent_delivery(&pool, "email-soft").await;

            let outcome = ingest_email_event(
                &pool,
                &config(),
                EmailWebhookEvent {
                    message_id: "email-soft".to_string(),
                    event: "bounced".to_string(),
                    error_code: None,
                    reason: Some("greylisted, try again later".to_string()),
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::Applied);

            let failed = DeliveryRepository::find_by_id(&pool, &delivery.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(failed.status, DeliveryStatus::Failed);
            assert!(!failed.is_permanent_failure);
            assert!(failed.is_retryable(3));
            assert!(failed.next_retry_at.is_some());

            // Once the schedule comes due, the worker claims it back.
            sqlx::query("UPDATE notification_deliveries SET next_retry_at = ? WHERE id = ?")
                .bind(chrono::Utc::now().naive_utc() - chrono::Duration::seconds(1))
                .bind(&delivery.id)
                .execute(&pool)
                .await
                .unwrap();
            let claimed = DeliveryRepository::claim_due_retries(&pool, 10, 3)
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].id, delivery.id);
            assert_eq!(claimed[0].status, DeliveryStatus::Pending);
        }

        #[tokio::test]
        async fn unknown_event_names_are_ignored() {
            let pool = setup_pool().await;
            seed_sent_delivery(&pool, "email-1").await;
            let outcome = ingest_email_event(
                &pool,
                &config(),
                EmailWebhookEvent {
                    message_id: "email-1".to_string(),
                    event: "opened".to_string(),
                    error_code: None,
                    reason: None,
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, IngestOutcome::UnknownEvent);
        }
    }
}
