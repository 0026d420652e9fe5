use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::User;
use crate::error::{AppError, AppResult};

pub struct UserRepository;

impl UserRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<User>> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, display_name, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Upsert used by tests and ops tooling; the engine itself only reads.
    pub async fn upsert(
        pool: &SqlitePool,
        id: &str,
        email: Option<&str>,
        display_name: &str,
    ) -> AppResult<User> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, display_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                updated_at = excluded.updated_at
            RETURNING id, email, display_name, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }
}
