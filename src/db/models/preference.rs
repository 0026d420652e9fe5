use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::NotificationCategory;

/// Master kill switch, one row per user. Highest priority in the hierarchy.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserGlobalPreference {
    pub id: String,
    pub user_id: String,
    pub all_disabled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Per-category opt-out; overrides type-level defaults for every type in the
/// category. Second priority.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserCategoryPreference {
    pub id: String,
    pub user_id: String,
    pub category: NotificationCategory,
    pub disabled: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Per-type preference with optional per-channel overrides. Third priority.
/// A NULL channel field means "defer to the type's support flag".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserTypePreference {
    pub id: String,
    pub user_id: String,
    pub type_id: String,
    pub disabled: bool,
    pub push_enabled: Option<bool>,
    pub email_enabled: Option<bool>,
    pub websocket_enabled: Option<bool>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Partial update applied on top of the current (or default) type preference.
/// For the channel fields, an absent key leaves the override alone while an
/// explicit null clears it back to "defer to the type".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTypePreference {
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub push_enabled: Option<Option<bool>>,
    #[serde(default, deserialize_with = "double_option")]
    pub email_enabled: Option<Option<bool>>,
    #[serde(default, deserialize_with = "double_option")]
    pub websocket_enabled: Option<Option<bool>>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<bool>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize as _;
    Option::<bool>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_null_and_value_are_distinct() {
        let absent: UpdateTypePreference = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.push_enabled, None);

        let cleared: UpdateTypePreference =
            serde_json::from_str(r#"{"push_enabled": null}"#).unwrap();
        assert_eq!(cleared.push_enabled, Some(None));

        let set: UpdateTypePreference =
            serde_json::from_str(r#"{"push_enabled": false}"#).unwrap();
        assert_eq!(set.push_enabled, Some(Some(false)));
    }
}
