use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Category a notification type belongs to. Category-level preferences
/// apply to every type in the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NotificationCategory {
    Transactional,
    Social,
    Marketing,
    System,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Transactional => "transactional",
            NotificationCategory::Social => "social",
            NotificationCategory::Marketing => "marketing",
            NotificationCategory::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transactional" => Some(NotificationCategory::Transactional),
            "social" => Some(NotificationCategory::Social),
            "marketing" => Some(NotificationCategory::Marketing),
            "system" => Some(NotificationCategory::System),
            _ => None,
        }
    }
}

/// Operator-managed configuration for a kind of notification.
///
/// Immutable at delivery time: the engine looks types up by `key` and never
/// creates or edits them as part of delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationType {
    pub id: String,
    pub key: String,
    pub category: NotificationCategory,
    pub title_template: String,
    pub body_template: String,
    pub supports_push: bool,
    pub supports_email: bool,
    pub supports_websocket: bool,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NotificationType {
    /// Whether this type can deliver on the given channel at all.
    pub fn supports(&self, channel: crate::db::models::Channel) -> bool {
        match channel {
            crate::db::models::Channel::Push => self.supports_push,
            crate::db::models::Channel::Email => self.supports_email,
            crate::db::models::Channel::Websocket => self.supports_websocket,
        }
    }
}

/// Data required to register a notification type (ops tooling / seeds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotificationType {
    pub key: String,
    pub category: NotificationCategory,
    pub title_template: String,
    pub body_template: String,
    pub supports_push: bool,
    pub supports_email: bool,
    pub supports_websocket: bool,
}
