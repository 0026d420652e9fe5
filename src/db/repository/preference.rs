use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    NotificationCategory, UpdateTypePreference, UserCategoryPreference, UserGlobalPreference,
    UserTypePreference,
};
use crate::error::{AppError, AppResult};

const GLOBAL_COLUMNS: &str = "id, user_id, all_disabled, created_at, updated_at";
const CATEGORY_COLUMNS: &str = "id, user_id, category, disabled, created_at, updated_at";
const TYPE_COLUMNS: &str = r#"
    id, user_id, type_id, disabled, push_enabled, email_enabled, websocket_enabled,
    created_at, updated_at
"#;

/// Accessor for the three layered preference tables. Missing rows always
/// read back as `None`; the resolver treats that as "not overridden".
pub struct PreferenceRepository;

impl PreferenceRepository {
    // ------------------------------------------------------------------
    // Global layer
    // ------------------------------------------------------------------

    pub async fn find_global(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Option<UserGlobalPreference>> {
        sqlx::query_as::<_, UserGlobalPreference>(&format!(
            r#"SELECT {GLOBAL_COLUMNS} FROM user_global_preferences WHERE user_id = ?"#
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn set_global(
        pool: &SqlitePool,
        user_id: &str,
        all_disabled: bool,
    ) -> AppResult<UserGlobalPreference> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, UserGlobalPreference>(&format!(
            r#"
            INSERT INTO user_global_preferences (id, user_id, all_disabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                all_disabled = excluded.all_disabled,
                updated_at = excluded.updated_at
            RETURNING {GLOBAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .bind(all_disabled)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    // ------------------------------------------------------------------
    // Category layer
    // ------------------------------------------------------------------

    pub async fn find_category(
        pool: &SqlitePool,
        user_id: &str,
        category: NotificationCategory,
    ) -> AppResult<Option<UserCategoryPreference>> {
        sqlx::query_as::<_, UserCategoryPreference>(&format!(
            r#"
            SELECT {CATEGORY_COLUMNS} FROM user_category_preferences
            WHERE user_id = ? AND category = ?
            "#
        ))
        .bind(user_id)
        .bind(category)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn set_category(
        pool: &SqlitePool,
        user_id: &str,
        category: NotificationCategory,
        disabled: bool,
    ) -> AppResult<UserCategoryPreference> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, UserCategoryPreference>(&format!(
            r#"
            INSERT INTO user_category_preferences (id, user_id, category, disabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, category) DO UPDATE SET
                disabled = excluded.disabled,
                updated_at = excluded.updated_at
            RETURNING {CATEGORY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .bind(category)
        .bind(disabled)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_categories(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<UserCategoryPreference>> {
        sqlx::query_as::<_, UserCategoryPreference>(&format!(
            r#"SELECT {CATEGORY_COLUMNS} FROM user_category_preferences WHERE user_id = ?"#
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    // ------------------------------------------------------------------
    // Type layer
    // ------------------------------------------------------------------

    pub async fn find_type(
        pool: &SqlitePool,
        user_id: &str,
        type_id: &str,
    ) -> AppResult<Option<UserTypePreference>> {
        sqlx::query_as::<_, UserTypePreference>(&format!(
            r#"
            SELECT {TYPE_COLUMNS} FROM user_type_preferences
            WHERE user_id = ? AND type_id = ?
            "#
        ))
        .bind(user_id)
        .bind(type_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Upsert the per-type row, merging the partial update over the current
    /// values (absent rows start from defaults: enabled, no overrides).
    pub async fn set_type(
        pool: &SqlitePool,
        user_id: &str,
        type_id: &str,
        update: UpdateTypePreference,
    ) -> AppResult<UserTypePreference> {
        let current = Self::find_type(pool, user_id, type_id).await?;

        let disabled = update
            .disabled
            .unwrap_or_else(|| current.as_ref().map(|c| c.disabled).unwrap_or(false));
        let push_enabled = update
            .push_enabled
            .unwrap_or_else(|| current.as_ref().and_then(|c| c.push_enabled));
        let email_enabled = update
            .email_enabled
            .unwrap_or_else(|| current.as_ref().and_then(|c| c.email_enabled));
        let websocket_enabled = update
            .websocket_enabled
            .unwrap_or_else(|| current.as_ref().and_then(|c| c.websocket_enabled));

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, UserTypePreference>(&format!(
            r#"
            INSERT INTO user_type_preferences (
                id, user_id, type_id, disabled,
                push_enabled, email_enabled, websocket_enabled,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, type_id) DO UPDATE SET
                disabled = excluded.disabled,
                push_enabled = excluded.push_enabled,
                email_enabled = excluded.email_enabled,
                websocket_enabled = excluded.websocket_enabled,
                updated_at = excluded.updated_at
            RETURNING {TYPE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .bind(type_id)
        .bind(disabled)
        .bind(push_enabled)
        .bind(email_enabled)
        .bind(websocket_enabled)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_types(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<UserTypePreference>> {
        sqlx::query_as::<_, UserTypePreference>(&format!(
            r#"SELECT {TYPE_COLUMNS} FROM user_type_preferences WHERE user_id = ?"#
        ))
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Remove every preference row for a user (reset to defaults).
    pub async fn delete_all_for_user(pool: &SqlitePool, user_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM user_global_preferences WHERE user_id = ?")
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        sqlx::query("DELETE FROM user_category_preferences WHERE user_id = ?")
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        sqlx::query("DELETE FROM user_type_preferences WHERE user_id = ?")
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk loads (broadcast path): one query per layer regardless of the
    // number of users.
    // ------------------------------------------------------------------

    pub async fn bulk_global(
        pool: &SqlitePool,
        user_ids: &[String],
    ) -> AppResult<HashMap<String, UserGlobalPreference>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            r#"SELECT {GLOBAL_COLUMNS} FROM user_global_preferences WHERE user_id IN ({placeholders})"#
        );
        let mut query = sqlx::query_as::<_, UserGlobalPreference>(&sql);
        for id in user_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await.map_err(AppError::Database)?;
        Ok(rows.into_iter().map(|p| (p.user_id.clone(), p)).collect())
    }

    pub async fn bulk_category(
        pool: &SqlitePool,
        user_ids: &[String],
        category: NotificationCategory,
    ) -> AppResult<HashMap<String, UserCategoryPreference>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT {CATEGORY_COLUMNS} FROM user_category_preferences
            WHERE category = ? AND user_id IN ({placeholders})
            "#
        );
        let mut query = sqlx::query_as::<_, UserCategoryPreference>(&sql).bind(category);
        for id in user_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await.map_err(AppError::Database)?;
        Ok(rows.into_iter().map(|p| (p.user_id.clone(), p)).collect())
    }

    pub async fn bulk_type(
        pool: &SqlitePool,
        user_ids: &[String],
        type_id: &str,
    ) -> AppResult<HashMap<String, UserTypePreference>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT {TYPE_COLUMNS} FROM user_type_preferences
            WHERE type_id = ? AND user_id IN ({placeholders})
            "#
        );
        let mut query = sqlx::query_as::<_, UserTypePreference>(&sql).bind(type_id);
        for id in user_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await.map_err(AppError::Database)?;
        Ok(rows.into_iter().map(|p| (p.user_id.clone(), p)).collect())
    }
}
