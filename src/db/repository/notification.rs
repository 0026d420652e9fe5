use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateNotification, Notification};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id, recipient_id, actor_id, type_id, title, body, data_json,
    source_kind, source_id, is_read, read_at, idempotency_key,
    created_at, updated_at
"#;

pub struct NotificationRepository;

impl NotificationRepository {
    /// Insert a notification. A UNIQUE violation on `idempotency_key` is
    /// surfaced as `AppError::Database`; callers detect it via
    /// `AppError::is_unique_violation` and fall back to
    /// [`find_by_idempotency_key`](Self::find_by_idempotency_key).
    pub async fn create(
        pool: &SqlitePool,
        input: CreateNotification,
    ) -> AppResult<Notification> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let (source_kind, source_id) = match &input.source {
            Some(s) => (Some(s.kind.clone()), Some(s.id.clone())),
            None => (None, None),
        };

        sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notifications (
                id, recipient_id, actor_id, type_id, title, body, data_json,
                source_kind, source_id, is_read, read_at, idempotency_key,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&input.recipient_id)
        .bind(&input.actor_id)
        .bind(&input.type_id)
        .bind(&input.title)
        .bind(&input.body)
        .bind(&input.data_json)
        .bind(source_kind)
        .bind(source_id)
        .bind(&input.idempotency_key)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"SELECT {COLUMNS} FROM notifications WHERE id = ?"#
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_idempotency_key(
        pool: &SqlitePool,
        key: &str,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"SELECT {COLUMNS} FROM notifications WHERE idempotency_key = ?"#
        ))
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_for_user(
        pool: &SqlitePool,
        user_id: &str,
        limit: i64,
        offset: i64,
        unread_only: bool,
    ) -> AppResult<Vec<Notification>> {
        let unread_clause = if unread_only { "AND is_read = 0" } else { "" };
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE recipient_id = ? {unread_clause}
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn count_for_user(
        pool: &SqlitePool,
        user_id: &str,
        unread_only: bool,
    ) -> AppResult<i64> {
        let unread_clause = if unread_only { "AND is_read = 0" } else { "" };
        let (count,): (i64,) = sqlx::query_as(&format!(
            r#"SELECT COUNT(*) FROM notifications WHERE recipient_id = ? {unread_clause}"#
        ))
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(count)
    }

    /// Mark specific notifications as read. Scoped to the owning user so a
    /// caller cannot flip someone else's rows. Returns the number updated.
    pub async fn mark_as_read(
        pool: &SqlitePool,
        user_id: &str,
        ids: &[String],
    ) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().naive_utc();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE notifications
            SET is_read = 1, read_at = ?, updated_at = ?
            WHERE recipient_id = ? AND is_read = 0 AND id IN ({placeholders})
            "#
        );
        let mut query = sqlx::query(&sql).bind(now).bind(now).bind(user_id);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(pool).await.map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    pub async fn mark_all_as_read(
        pool: &SqlitePool,
        user_id: &str,
        type_id: Option<&str>,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let type_clause = if type_id.is_some() {
            "AND type_id = ?"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE notifications
            SET is_read = 1, read_at = ?, updated_at = ?
            WHERE recipient_id = ? AND is_read = 0 {type_clause}
            "#
        );
        let mut query = sqlx::query(&sql).bind(now).bind(now).bind(user_id);
        if let Some(tid) = type_id {
            query = query.bind(tid);
        }
        let result = query.execute(pool).await.map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
