use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single notification instance for one recipient.
///
/// Created once by the factory; the only later mutation is flipping
/// `is_read`. Never deleted by the delivery engine.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub actor_id: Option<String>,
    pub type_id: String,
    pub title: String,
    pub body: String,

    /// JSON-serialized key/value payload used for template substitution and
    /// forwarded to clients verbatim.
    pub data_json: String,

    /// Tagged reference to an object in the surrounding system
    /// (`{kind, id}`). Stored and forwarded, never dereferenced here.
    pub source_kind: Option<String>,
    pub source_id: Option<String>,

    pub is_read: bool,
    pub read_at: Option<NaiveDateTime>,

    /// Caller-supplied deduplication token; UNIQUE in the store.
    pub idempotency_key: Option<String>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Notification {
    /// Parse the stored payload. A malformed payload degrades to an empty
    /// map rather than failing delivery.
    pub fn data(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(&self.data_json).unwrap_or_default()
    }
}

/// Opaque reference to an object owned by the surrounding system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: String,
    pub id: String,
}

/// Data required to persist a new notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotification {
    pub recipient_id: String,
    pub actor_id: Option<String>,
    pub type_id: String,
    pub title: String,
    pub body: String,
    pub data_json: String,
    pub source: Option<SourceRef>,
    pub idempotency_key: Option<String>,
}
