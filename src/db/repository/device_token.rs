use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{DeviceToken, RegisterDeviceToken};
use crate::error::{AppError, AppResult};

const COLUMNS: &str =
    "id, user_id, token, platform, device_id, device_name, is_active, created_at, updated_at";

pub struct DeviceTokenRepository;

impl DeviceTokenRepository {
    /// Register or refresh a device token. A device re-registering gets its
    /// token replaced; a token moving between users is reassigned to the new
    /// owner. Both rows are reactivated on conflict.
    pub async fn register(
        pool: &SqlitePool,
        input: RegisterDeviceToken,
    ) -> AppResult<DeviceToken> {
        let now = Utc::now().naive_utc();

        // A token can only belong to one (user, device) pair. Clear any
        // stale row holding this token for a different device first.
        sqlx::query(
            r#"
            DELETE FROM device_tokens
            WHERE token = ? AND NOT (user_id = ? AND device_id = ?)
            "#,
        )
        .bind(&input.token)
        .bind(&input.user_id)
        .bind(&input.device_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        let id = Uuid::new_v4().to_string();
        sqlx::query_as::<_, DeviceToken>(&format!(
            r#"
            INSERT INTO device_tokens (
                id, user_id, token, platform, device_id, device_name,
                is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (user_id, device_id) DO UPDATE SET
                token = excluded.token,
                platform = excluded.platform,
                device_name = excluded.device_name,
                is_active = 1,
                updated_at = excluded.updated_at
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&input.user_id)
        .bind(&input.token)
        .bind(&input.platform)
        .bind(&input.device_id)
        .bind(input.device_name.as_deref().unwrap_or(""))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_active_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<DeviceToken>> {
        sqlx::query_as::<_, DeviceToken>(&format!(
            r#"
            SELECT {COLUMNS} FROM device_tokens
            WHERE user_id = ? AND is_active = 1
            ORDER BY created_at
            "#
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Deactivate one device's token (explicit unregister).
    pub async fn deactivate(
        pool: &SqlitePool,
        user_id: &str,
        device_id: &str,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE device_tokens
            SET is_active = 0, updated_at = ?
            WHERE user_id = ? AND device_id = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(user_id)
        .bind(device_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Deactivate by raw token value. Used when a push provider reports the
    /// token unregistered or invalid.
    pub async fn deactivate_by_token(pool: &SqlitePool, token: &str) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE device_tokens
            SET is_active = 0, updated_at = ?
            WHERE token = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(token)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
