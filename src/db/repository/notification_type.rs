use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateNotificationType, NotificationType};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id, key, category, title_template, body_template,
    supports_push, supports_email, supports_websocket, is_active,
    created_at, updated_at
"#;

pub struct NotificationTypeRepository;

impl NotificationTypeRepository {
    pub async fn create(
        pool: &SqlitePool,
        input: CreateNotificationType,
    ) -> AppResult<NotificationType> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, NotificationType>(&format!(
            r#"
            INSERT INTO notification_types (
                id, key, category, title_template, body_template,
                supports_push, supports_email, supports_websocket, is_active,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&input.key)
        .bind(input.category)
        .bind(&input.title_template)
        .bind(&input.body_template)
        .bind(input.supports_push)
        .bind(input.supports_email)
        .bind(input.supports_websocket)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_key(
        pool: &SqlitePool,
        key: &str,
    ) -> AppResult<Option<NotificationType>> {
        sqlx::query_as::<_, NotificationType>(&format!(
            r#"SELECT {COLUMNS} FROM notification_types WHERE key = ?"#
        ))
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<NotificationType>> {
        sqlx::query_as::<_, NotificationType>(&format!(
            r#"SELECT {COLUMNS} FROM notification_types WHERE id = ?"#
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Active type by key, the lookup the factory uses.
    pub async fn find_active_by_key(
        pool: &SqlitePool,
        key: &str,
    ) -> AppResult<Option<NotificationType>> {
        sqlx::query_as::<_, NotificationType>(&format!(
            r#"SELECT {COLUMNS} FROM notification_types WHERE key = ? AND is_active = 1"#
        ))
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_active(pool: &SqlitePool) -> AppResult<Vec<NotificationType>> {
        sqlx::query_as::<_, NotificationType>(&format!(
            r#"SELECT {COLUMNS} FROM notification_types WHERE is_active = 1 ORDER BY key"#
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
