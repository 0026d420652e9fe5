use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Channel, DeliveryStatus, NotificationDelivery, SkipReason};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id, notification_id, channel, status,
    sent_at, delivered_at, failed_at,
    provider_message_id, failure_reason, failure_code, is_permanent_failure,
    attempt_count, next_retry_at, skipped_reason,
    devices_targeted, devices_reached,
    created_at, updated_at
"#;

/// Repository for delivery records.
///
/// Implementation notes:
/// - Every status transition is a single guarded UPDATE
///   (`... WHERE id = ? AND status = '<expected>' RETURNING ...`). On SQLite
///   this is the select-for-update equivalent: the statement is atomic, and a
///   guard mismatch (late webhook, duplicate worker) simply matches zero rows.
///   Callers treat `None` as an ignored stale event, not an error.
/// - Retry claiming uses an atomic `UPDATE ... WHERE id = (SELECT ... LIMIT 1)
///   RETURNING ...` loop to avoid a long-lived transaction.
pub struct DeliveryRepository;

impl DeliveryRepository {
    /// Insert a delivery row, idempotent on (notification_id, channel):
    /// a second dispatch returns the existing row untouched.
    pub async fn create(
        pool: &SqlitePool,
        notification_id: &str,
        channel: Channel,
        status: DeliveryStatus,
        skipped_reason: Option<SkipReason>,
    ) -> AppResult<NotificationDelivery> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let inserted = sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            INSERT INTO notification_deliveries (
                id, notification_id, channel, status, skipped_reason,
                attempt_count, devices_targeted, devices_reached,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, 0, 0, ?, ?)
            ON CONFLICT (notification_id, channel) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(notification_id)
        .bind(channel)
        .bind(status)
        .bind(skipped_reason)
        .bind(now)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        if let Some(delivery) = inserted {
            return Ok(delivery);
        }

        // Conflict: the row already exists from an earlier dispatch.
        let existing = Self::find_by_notification_and_channel(pool, notification_id, channel)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "delivery row vanished after insert conflict"
                ))
            })?;
        tracing::debug!(
            "Delivery for notification {} channel {} already exists (status={}), re-dispatch ignored",
            notification_id,
            channel.as_str(),
            existing.status.as_str()
        );
        Ok(existing)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"SELECT {COLUMNS} FROM notification_deliveries WHERE id = ?"#
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_notification_and_channel(
        pool: &SqlitePool,
        notification_id: &str,
        channel: Channel,
    ) -> AppResult<Option<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            SELECT {COLUMNS} FROM notification_deliveries
            WHERE notification_id = ? AND channel = ?
            "#
        ))
        .bind(notification_id)
        .bind(channel)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_provider_message_id(
        pool: &SqlitePool,
        provider_message_id: &str,
    ) -> AppResult<Option<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            SELECT {COLUMNS} FROM notification_deliveries
            WHERE provider_message_id = ?
            "#
        ))
        .bind(provider_message_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Delivery audit trail for one notification.
    pub async fn list_for_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<NotificationDelivery>> {
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            SELECT {COLUMNS} FROM notification_deliveries
            WHERE notification_id = ?
            ORDER BY channel
            "#
        ))
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// pending -> sent. Records the provider message id and counts the
    /// attempt. `None` when the delivery left `pending` in the meantime.
    pub async fn mark_sent(
        pool: &SqlitePool,
        id: &str,
        provider_message_id: &str,
    ) -> AppResult<Option<NotificationDelivery>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            UPDATE notification_deliveries
            SET status = 'sent',
                sent_at = ?,
                provider_message_id = ?,
                attempt_count = attempt_count + 1,
                next_retry_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(provider_message_id)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// pending -> failed, counting the attempt. `next_retry_at` is set only
    /// for retryable failures; permanent failures are terminal immediately.
    pub async fn mark_attempt_failed(
        pool: &SqlitePool,
        id: &str,
        reason: &str,
        code: Option<&str>,
        is_permanent: bool,
        next_retry_at: Option<NaiveDateTime>,
    ) -> AppResult<Option<NotificationDelivery>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            UPDATE notification_deliveries
            SET status = 'failed',
                failed_at = ?,
                failure_reason = ?,
                failure_code = ?,
                is_permanent_failure = ?,
                attempt_count = attempt_count + 1,
                next_retry_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(reason)
        .bind(code)
        .bind(is_permanent)
        .bind(next_retry_at)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// sent -> delivered, driven by a provider webhook. Does not touch
    /// `attempt_count`.
    pub async fn mark_delivered(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<NotificationDelivery>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            UPDATE notification_deliveries
            SET status = 'delivered',
                delivered_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'sent'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// sent -> failed (post-acceptance bounce reported by webhook). No
    /// attempt increment: the send already happened. `next_retry_at` is set
    /// for transient bounces with attempts left so the retry worker can
    /// pick the delivery back up.
    pub async fn mark_bounced(
        pool: &SqlitePool,
        id: &str,
        reason: &str,
        code: Option<&str>,
        is_permanent: bool,
        next_retry_at: Option<NaiveDateTime>,
    ) -> AppResult<Option<NotificationDelivery>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            UPDATE notification_deliveries
            SET status = 'failed',
                failed_at = ?,
                failure_reason = ?,
                failure_code = ?,
                is_permanent_failure = ?,
                next_retry_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'sent'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(reason)
        .bind(code)
        .bind(is_permanent)
        .bind(next_retry_at)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// pending -> skipped (capability missing discovered at send time,
    /// e.g. websocket with zero connections).
    pub async fn mark_skipped(
        pool: &SqlitePool,
        id: &str,
        reason: SkipReason,
    ) -> AppResult<Option<NotificationDelivery>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            UPDATE notification_deliveries
            SET status = 'skipped',
                skipped_reason = ?,
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(reason)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Websocket collapse: pending -> delivered in one step, recording both
    /// timestamps and the connection counters.
    pub async fn mark_websocket_delivered(
        pool: &SqlitePool,
        id: &str,
        devices_targeted: i64,
        devices_reached: i64,
    ) -> AppResult<Option<NotificationDelivery>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, NotificationDelivery>(&format!(
            r#"
            UPDATE notification_deliveries
            SET status = 'delivered',
                sent_at = ?,
                delivered_at = ?,
                attempt_count = attempt_count + 1,
                devices_targeted = ?,
                devices_reached = ?,
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(devices_targeted)
        .bind(devices_reached)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Claim up to `limit` due retryable failed deliveries, transitioning
    /// each failed -> pending. The claim itself is the retry transition, so
    /// two workers can never double-claim the same delivery.
    pub async fn claim_due_retries(
        pool: &SqlitePool,
        limit: i64,
        max_attempts: u32,
    ) -> AppResult<Vec<NotificationDelivery>> {
        let mut claimed = Vec::new();
        if limit <= 0 {
            return Ok(claimed);
        }

        for _ in 0..(limit as usize) {
            let now = Utc::now().naive_utc();
            let opt = sqlx::query_as::<_, NotificationDelivery>(&format!(
                r#"
                UPDATE notification_deliveries
                SET status = 'pending', next_retry_at = NULL, updated_at = ?
                WHERE id = (
                    SELECT id FROM notification_deliveries
                    WHERE status = 'failed'
                      AND is_permanent_failure = 0
                      AND attempt_count < ?
                      AND next_retry_at IS NOT NULL
                      AND next_retry_at <= ?
                    ORDER BY next_retry_at ASC
                    LIMIT 1
                )
                RETURNING {COLUMNS}
                "#
            ))
            .bind(now)
            .bind(max_attempts as i64)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            match opt {
                Some(delivery) => claimed.push(delivery),
                None => break,
            }
        }

        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_notification, seed_type, seed_user, setup_pool};

    async fn seed_delivery(pool: &SqlitePool) -> NotificationDelivery {
        seed_user(pool, "u1", Some("u1@example.com")).await;
        let ntype = seed_type(pool, "order_shipped").await;
        let notification = seed_notification(pool, "u1", &ntype.id).await;
        DeliveryRepository::create(
            pool,
            &notification.id,
            Channel::Push,
            DeliveryStatus::Pending,
            None,
        )
        .await
        .expect("create delivery")
    }

    #[tokio::test]
    async fn create_is_idempotent_per_channel() {
        let pool = setup_pool().await;
        let first = seed_delivery(&pool).await;
        let sent = DeliveryRepository::mark_sent(&pool, &first.id, "fcm-abc")
            .await
            .unwrap()
            .unwrap();

        // Re-dispatch returns the existing row with its progressed state.
        let second = DeliveryRepository::create(
            &pool,
            &first.notification_id,
            Channel::Push,
            DeliveryStatus::Pending,
            None,
        )
        .await
        .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, DeliveryStatus::Sent);
        assert_eq!(second.provider_message_id, sent.provider_message_id);
    }

    #[tokio::test]
    async fn guarded_transitions_ignore_stale_events() {
        let pool = setup_pool().await;
        let delivery = seed_delivery(&pool).await;

        let sent = DeliveryRepository::mark_sent(&pool, &delivery.id, "fcm-1")
            .await
            .unwrap()
            .expect("pending -> sent");
        assert_eq!(sent.attempt_count, 1);
        assert!(sent.sent_at.is_some());

        // A second sender racing on the same row matches nothing.
        assert!(DeliveryRepository::mark_sent(&pool, &delivery.id, "fcm-2")
            .await
            .unwrap()
            .is_none());
        // So does a pending-guard failure after the send.
        assert!(DeliveryRepository::mark_attempt_failed(
            &pool, &delivery.id, "timeout", None, false, None
        )
        .await
        .unwrap()
        .is_none());

        let delivered = DeliveryRepository::mark_delivered(&pool, &delivery.id)
            .await
            .unwrap()
            .expect("sent -> delivered");
        assert!(delivered.delivered_at.is_some());
        // Attempt count is never touched by webhook-driven transitions.
        assert_eq!(delivered.attempt_count, 1);

        // Duplicate and late events on a terminal row are no-ops.
        assert!(DeliveryRepository::mark_delivered(&pool, &delivery.id)
            .await
            .unwrap()
            .is_none());
        assert!(
            DeliveryRepository::mark_bounced(&pool, &delivery.id, "bounce", None, true, None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn websocket_collapse_records_counts() {
        let pool = setup_pool().await;
        let delivery = seed_delivery(&pool).await;
        let updated = DeliveryRepository::mark_websocket_delivered(&pool, &delivery.id, 3, 2)
            .await
            .unwrap()
            .expect("pending -> delivered");
        assert_eq!(updated.status, DeliveryStatus::Delivered);
        assert_eq!(updated.devices_targeted, 3);
        assert_eq!(updated.devices_reached, 2);
        assert!(updated.sent_at.is_some());
        assert!(updated.delivered_at.is_some());
        assert_eq!(updated.attempt_count, 1);
    }

    #[tokio::test]
    async fn claim_due_retries_skips_permanent_undue_and_exhausted() {
        let pool = setup_pool().await;
        seed_user(&pool, "u1", None).await;
        let ntype = seed_type(&pool, "order_shipped").await;
        let now = Utc::now().naive_utc();

        let mut ids = Vec::new();
        for channel in [Channel::Push, Channel::Email, Channel::Websocket] {
            let notification = seed_notification(&pool, "u1", &ntype.id).await;
            let d = DeliveryRepository::create(
                &pool,
                &notification.id,
                channel,
                DeliveryStatus::Pending,
                None,
            )
            .await
            .unwrap();
            ids.push(d.id);
        }

        // Due transient failure: claimable.
        DeliveryRepository::mark_attempt_failed(
            &pool,
            &ids[0],
            "timeout",
            None,
            false,
            Some(now - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap()
        .unwrap();
        // Permanent failure: never claimable.
        DeliveryRepository::mark_attempt_failed(
            &pool,
            &ids[1],
            "bad token",
            Some("invalid_token"),
            true,
            None,
        )
        .await
        .unwrap()
        .unwrap();
        // Transient but not yet due.
        DeliveryRepository::mark_attempt_failed(
            &pool,
            &ids[2],
            "timeout",
            None,
            false,
            Some(now + chrono::Duration::minutes(10)),
        )
        .await
        .unwrap()
        .unwrap();

        let claimed = DeliveryRepository::claim_due_retries(&pool, 10, 3).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, ids[0]);
        assert_eq!(claimed[0].status, DeliveryStatus::Pending);
        assert!(claimed[0].next_retry_at.is_none());

        // The claim is the transition: nothing is left to claim.
        let again = DeliveryRepository::claim_due_retries(&pool, 10, 3).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_max_attempts() {
        let pool = setup_pool().await;
        let delivery = seed_delivery(&pool).await;
        let past = Utc::now().naive_utc() - chrono::Duration::seconds(1);

        // Fail three times (pending -> failed, reclaim, repeat).
        for _ in 0..2 {
            DeliveryRepository::mark_attempt_failed(
                &pool, &delivery.id, "timeout", None, false, Some(past),
            )
            .await
            .unwrap()
            .unwrap();
            let claimed = DeliveryRepository::claim_due_retries(&pool, 10, 3).await.unwrap();
            assert_eq!(claimed.len(), 1);
        }
        let exhausted = DeliveryRepository::mark_attempt_failed(
            &pool, &delivery.id, "timeout", None, false, Some(past),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exhausted.attempt_count, 3);

        // Three attempts used: terminal even with next_retry_at in the past.
        let claimed = DeliveryRepository::claim_due_retries(&pool, 10, 3).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn provider_message_lookup() {
        let pool = setup_pool().await;
        let delivery = seed_delivery(&pool).await;
        DeliveryRepository::mark_sent(&pool, &delivery.id, "fcm-lookup")
            .await
            .unwrap()
            .unwrap();

        let found = DeliveryRepository::find_by_provider_message_id(&pool, "fcm-lookup")
            .await
            .unwrap()
            .expect("lookup by provider id");
        assert_eq!(found.id, delivery.id);
        assert!(
            DeliveryRepository::find_by_provider_message_id(&pool, "fcm-unknown")
                .await
                .unwrap()
                .is_none()
        );
    }
}
