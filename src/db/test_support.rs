//! Shared fixtures for database-backed tests.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db::models::{CreateNotification, CreateNotificationType, Notification,
    NotificationCategory, NotificationType, RegisterDeviceToken, User};
use crate::db::repository::{
    DeviceTokenRepository, NotificationRepository, NotificationTypeRepository, UserRepository,
};

/// Fresh in-memory database with all migrations applied. One connection so
/// every query sees the same memory database.
pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect to in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

pub async fn seed_user(pool: &SqlitePool, id: &str, email: Option<&str>) -> User {
    UserRepository::upsert(pool, id, email, "Test User")
        .await
        .expect("seed user")
}

pub async fn seed_type(pool: &SqlitePool, key: &str) -> NotificationType {
    seed_type_with_channels(pool, key, true, true, true).await
}

pub async fn seed_type_with_channels(
    pool: &SqlitePool,
    key: &str,
    push: bool,
    email: bool,
    websocket: bool,
) -> NotificationType {
    NotificationTypeRepository::create(
        pool,
        CreateNotificationType {
            key: key.to_string(),
            category: NotificationCategory::Transactional,
            title_template: "Order {order_id} update".to_string(),
            body_template: "Status: {status}".to_string(),
            supports_push: push,
            supports_email: email,
            supports_websocket: websocket,
        },
    )
    .await
    .expect("seed notification type")
}

pub async fn seed_notification(
    pool: &SqlitePool,
    recipient_id: &str,
    type_id: &str,
) -> Notification {
    NotificationRepository::create(
        pool,
        CreateNotification {
            recipient_id: recipient_id.to_string(),
            actor_id: None,
            type_id: type_id.to_string(),
            title: "Order A-1 update".to_string(),
            body: "Status: shipped".to_string(),
            data_json: r#"{"order_id":"A-1","status":"shipped"}"#.to_string(),
            source: None,
            idempotency_key: None,
        },
    )
    .await
    .expect("seed notification")
}

pub async fn seed_device(pool: &SqlitePool, user_id: &str, device_id: &str, token: &str) {
    DeviceTokenRepository::register(
        pool,
        RegisterDeviceToken {
            user_id: user_id.to_string(),
            token: token.to_string(),
            platform: "android".to_string(),
            device_id: device_id.to_string(),
            device_name: None,
        },
    )
    .await
    .expect("seed device token");
}
