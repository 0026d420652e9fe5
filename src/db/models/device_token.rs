use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Registered push destination (FCM/APNs token) for one device of a user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub platform: String,
    pub device_id: String,
    pub device_name: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to register (or refresh) a device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceToken {
    pub user_id: String,
    pub token: String,
    pub platform: String,
    pub device_id: String,
    pub device_name: Option<String>,
}
