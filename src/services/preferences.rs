use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::db::models::{
    Channel, NotificationType, SkipReason, UserCategoryPreference, UserGlobalPreference,
    UserTypePreference,
};
use crate::db::repository::PreferenceRepository;

/// Outcome of resolving one (user, notification type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPreferences {
    /// False when a hierarchy layer blocks the notification entirely.
    pub allowed: bool,
    /// The layer that blocked, when `allowed` is false.
    pub blocked_reason: Option<SkipReason>,
    pub push: bool,
    pub email: bool,
    pub websocket: bool,
}

impl ResolvedPreferences {
    /// Everything off, annotated with the blocking layer.
    fn blocked(reason: SkipReason) -> Self {
        Self {
            allowed: false,
            blocked_reason: Some(reason),
            push: false,
            email: false,
            websocket: false,
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push,
            Channel::Email => self.email,
            Channel::Websocket => self.websocket,
        }
    }
}

/// Pure resolution over the three optional preference rows.
///
/// Priority order: global kill switch, then category opt-out, then per-type
/// row. Absent rows never block. Per-channel overrides only narrow within
/// what the type itself supports.
pub fn resolve_preferences(
    ntype: &NotificationType,
    global: Option<&UserGlobalPreference>,
    category: Option<&UserCategoryPreference>,
    type_pref: Option<&UserTypePreference>,
) -> ResolvedPreferences {
    if global.map(|g| g.all_disabled).unwrap_or(false) {
        return ResolvedPreferences::blocked(SkipReason::GlobalDisabled);
    }
    if category.map(|c| c.disabled).unwrap_or(false) {
        return ResolvedPreferences::blocked(SkipReason::CategoryDisabled);
    }
    if type_pref.map(|t| t.disabled).unwrap_or(false) {
        return ResolvedPreferences::blocked(SkipReason::TypeDisabled);
    }

    let override_for = |channel: Channel| -> Option<bool> {
        type_pref.and_then(|t| match channel {
            Channel::Push => t.push_enabled,
            Channel::Email => t.email_enabled,
            Channel::Websocket => t.websocket_enabled,
        })
    };
    let channel_on =
        |channel: Channel| ntype.supports(channel) && override_for(channel).unwrap_or(true);

    ResolvedPreferences {
        allowed: true,
        blocked_reason: None,
        push: channel_on(Channel::Push),
        email: channel_on(Channel::Email),
        websocket: channel_on(Channel::Websocket),
    }
}

/// Short-lived cache over resolved preferences, keyed per (user, type).
#[async_trait]
pub trait PreferenceCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<ResolvedPreferences>;
    async fn set(&self, key: &str, value: ResolvedPreferences, ttl: Duration);
    /// Drop every entry whose key starts with `prefix`.
    async fn invalidate_prefix(&self, prefix: &str);
}

/// In-process cache with per-entry expiry. Expired entries are dropped
/// lazily on read and swept on write.
#[derive(Default)]
pub struct MemoryPreferenceCache {
    entries: RwLock<HashMap<String, (Instant, ResolvedPreferences)>>,
}

impl MemoryPreferenceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceCache for MemoryPreferenceCache {
    async fn get(&self, key: &str) -> Option<ResolvedPreferences> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((expires_at, value)) if *expires_at > Instant::now() => Some(value.clone()),
            _ => None,
        }
    }

    async fn set(&self, key: &str, value: ResolvedPreferences, ttl: Duration) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        entries.insert(key.to_string(), (now + ttl, value));
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| !key.starts_with(prefix));
    }
}

fn cache_key(user_id: &str, type_id: &str) -> String {
    format!("notif_pref:{user_id}:{type_id}")
}

fn user_prefix(user_id: &str) -> String {
    format!("notif_pref:{user_id}:")
}

/// Resolves the preference hierarchy for delivery decisions.
///
/// Resolution is deliberately infallible: a storage error falls back to the
/// default-allow result so a flaky database degrades to "send everything the
/// type supports" rather than dropping notifications.
pub struct PreferenceResolver {
    pool: SqlitePool,
    cache: Arc<dyn PreferenceCache>,
    cache_ttl: Duration,
}

impl PreferenceResolver {
    pub fn new(pool: SqlitePool, cache: Arc<dyn PreferenceCache>, cache_ttl: Duration) -> Self {
        Self {
            pool,
            cache,
            cache_ttl,
        }
    }

    /// `use_cache: false` skips the cache read (forcing a fresh resolution)
    /// but still stores the result for later lookups.
    pub async fn resolve(
        &self,
        user_id: &str,
        ntype: &NotificationType,
        use_cache: bool,
    ) -> ResolvedPreferences {
        let key = cache_key(user_id, &ntype.id);
        if use_cache {
            if let Some(cached) = self.cache.get(&key).await {
                return cached;
            }
        }

        let resolved = match self.load_and_resolve(user_id, ntype).await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(
                    "Preference lookup failed for user {}, type {}; defaulting to allow: {}",
                    user_id,
                    ntype.key,
                    err
                );
                resolve_preferences(ntype, None, None, None)
            }
        };

        self.cache.set(&key, resolved.clone(), self.cache_ttl).await;
        resolved
    }

    async fn load_and_resolve(
        &self,
        user_id: &str,
        ntype: &NotificationType,
    ) -> crate::error::AppResult<ResolvedPreferences> {
        let global = PreferenceRepository::find_global(&self.pool, user_id).await?;
        let category =
            PreferenceRepository::find_category(&self.pool, user_id, ntype.category).await?;
        let type_pref = PreferenceRepository::find_type(&self.pool, user_id, &ntype.id).await?;
        Ok(resolve_preferences(
            ntype,
            global.as_ref(),
            category.as_ref(),
            type_pref.as_ref(),
        ))
    }

    /// Resolve many users against one type with three batched queries,
    /// regardless of recipient count. Used by the broadcast path; skips the
    /// cache both ways since broadcast recipient sets rarely repeat.
    pub async fn resolve_bulk(
        &self,
        user_ids: &[String],
        ntype: &NotificationType,
    ) -> HashMap<String, ResolvedPreferences> {
        let loaded = async {
            let globals = PreferenceRepository::bulk_global(&self.pool, user_ids).await?;
            let categories =
                PreferenceRepository::bulk_category(&self.pool, user_ids, ntype.category).await?;
            let types = PreferenceRepository::bulk_type(&self.pool, user_ids, &ntype.id).await?;
            crate::error::AppResult::Ok((globals, categories, types))
        }
        .await;

        let (globals, categories, types) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(
                    "Bulk preference lookup failed for type {}; defaulting {} users to allow: {}",
                    ntype.key,
                    user_ids.len(),
                    err
                );
                Default::default()
            }
        };

        user_ids
            .iter()
            .map(|user_id| {
                let resolved = resolve_preferences(
                    ntype,
                    globals.get(user_id),
                    categories.get(user_id),
                    types.get(user_id),
                );
                (user_id.clone(), resolved)
            })
            .collect()
    }

    /// Drop every cached resolution for a user. Called by each preference
    /// mutation before it returns.
    pub async fn invalidate_user(&self, user_id: &str) {
        self.cache.invalidate_prefix(&user_prefix(user_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NotificationCategory;
    use chrono::Utc;

    fn ntype(push: bool, email: bool, websocket: bool) -> NotificationType {
        let now = Utc::now().naive_utc();
        NotificationType {
            id: "t1".into(),
            key: "order_shipped".into(),
            category: NotificationCategory::Transactional,
            title_template: "Order {order_id} shipped".into(),
            body_template: "On its way".into(),
            supports_push: push,
            supports_email: email,
            supports_websocket: websocket,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn global(all_disabled: bool) -> UserGlobalPreference {
        let now = Utc::now().naive_utc();
        UserGlobalPreference {
            id: "g1".into(),
            user_id: "u1".into(),
            all_disabled,
            created_at: now,
            updated_at: now,
        }
    }

    fn category(disabled: bool) -> UserCategoryPreference {
        let now = Utc::now().naive_utc();
        UserCategoryPreference {
            id: "c1".into(),
            user_id: "u1".into(),
            category: NotificationCategory::Transactional,
            disabled,
            created_at: now,
            updated_at: now,
        }
    }

    fn type_pref(
        disabled: bool,
        push: Option<bool>,
        email: Option<bool>,
        websocket: Option<bool>,
    ) -> UserTypePreference {
        let now = Utc::now().naive_utc();
        UserTypePreference {
            id: "tp1".into(),
            user_id: "u1".into(),
            type_id: "t1".into(),
            disabled,
            push_enabled: push,
            email_enabled: email,
            websocket_enabled: websocket,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn no_rows_defaults_to_type_support() {
        let resolved = resolve_preferences(&ntype(true, false, true), None, None, None);
        assert!(resolved.allowed);
        assert!(resolved.push);
        assert!(!resolved.email);
        assert!(resolved.websocket);
    }

    #[test]
    fn global_kill_switch_wins_over_everything() {
        let resolved = resolve_preferences(
            &ntype(true, true, true),
            Some(&global(true)),
            Some(&category(false)),
            Some(&type_pref(false, Some(true), Some(true), Some(true))),
        );
        assert!(!resolved.allowed);
        assert_eq!(resolved.blocked_reason, Some(SkipReason::GlobalDisabled));
        assert!(!resolved.push && !resolved.email && !resolved.websocket);
    }

    #[test]
    fn category_opt_out_beats_type_enable() {
        let resolved = resolve_preferences(
            &ntype(true, true, true),
            Some(&global(false)),
            Some(&category(true)),
            Some(&type_pref(false, Some(true), None, None)),
        );
        assert!(!resolved.allowed);
        assert_eq!(resolved.blocked_reason, Some(SkipReason::CategoryDisabled));
    }

    #[test]
    fn type_disable_blocks_all_channels() {
        let resolved = resolve_preferences(
            &ntype(true, true, true),
            None,
            None,
            Some(&type_pref(true, Some(true), Some(true), Some(true))),
        );
        assert!(!resolved.allowed);
        assert_eq!(resolved.blocked_reason, Some(SkipReason::TypeDisabled));
    }

    #[test]
    fn channel_override_narrows_within_type_support() {
        let resolved = resolve_preferences(
            &ntype(true, true, false),
            None,
            None,
            Some(&type_pref(false, Some(false), None, Some(true))),
        );
        assert!(resolved.allowed);
        // push supported but overridden off
        assert!(!resolved.push);
        // email supported, no override, stays on
        assert!(resolved.email);
        // websocket override cannot enable an unsupported channel
        assert!(!resolved.websocket);
    }

    #[tokio::test]
    async fn memory_cache_honors_ttl_and_prefix_invalidation() {
        let cache = MemoryPreferenceCache::new();
        let value = resolve_preferences(&ntype(true, true, true), None, None, None);

        cache
            .set("notif_pref:u1:t1", value.clone(), Duration::from_secs(60))
            .await;
        cache
            .set("notif_pref:u2:t1", value.clone(), Duration::from_secs(60))
            .await;
        assert!(cache.get("notif_pref:u1:t1").await.is_some());

        cache.invalidate_prefix("notif_pref:u1:").await;
        assert!(cache.get("notif_pref:u1:t1").await.is_none());
        assert!(cache.get("notif_pref:u2:t1").await.is_some());

        cache
            .set("notif_pref:u3:t1", value, Duration::from_millis(0))
            .await;
        assert!(cache.get("notif_pref:u3:t1").await.is_none());
    }

    mod integration {
        use super::*;
        use crate::db::repository::PreferenceRepository;
        use crate::db::test_support::{seed_type, seed_user, setup_pool};

        #[tokio::test]
        async fn resolver_serves_cached_until_invalidated() {
            let pool = setup_pool().await;
            seed_user(&pool, "u1", None).await;
            let ntype = seed_type(&pool, "order_shipped").await;
            let resolver = PreferenceResolver::new(
                pool.clone(),
                Arc::new(MemoryPreferenceCache::new()),
                Duration::from_secs(300),
            );

            assert!(resolver.resolve("u1", &ntype, true).await.allowed);

            // The store changed but the cache still answers.
            PreferenceRepository::set_global(&pool, "u1", true).await.unwrap();
            assert!(resolver.resolve("u1", &ntype, true).await.allowed);

            resolver.invalidate_user("u1").await;
            let resolved = resolver.resolve("u1", &ntype, true).await;
            assert!(!resolved.allowed);
            assert_eq!(resolved.blocked_reason, Some(SkipReason::GlobalDisabled));
        }

        #[tokio::test]
        async fn uncached_resolve_bypasses_stale_entries_and_repopulates() {
            let pool = setup_pool().await;
            seed_user(&pool, "u1", None).await;
            let ntype = seed_type(&pool, "order_shipped").await;
            let resolver = PreferenceResolver::new(
                pool.clone(),
                Arc::new(MemoryPreferenceCache::new()),
                Duration::from_secs(300),
            );

            assert!(resolver.resolve("u1", &ntype, true).await.allowed);
            PreferenceRepository::set_global(&pool, "u1", true).await.unwrap();

            // Bypassing the read sees the new store state immediately.
            let fresh = resolver.resolve("u1", &ntype, false).await;
            assert!(!fresh.allowed);
            assert_eq!(fresh.blocked_reason, Some(SkipReason::GlobalDisabled));

            // And it refreshed the cache for subsequent cached reads.
            assert!(!resolver.resolve("u1", &ntype, true).await.allowed);
        }

        #[tokio::test]
        async fn resolve_bulk_matches_singular_resolution() {
            let pool = setup_pool().await;
            seed_user(&pool, "u1", None).await;
            seed_user(&pool, "u2", None).await;
            seed_user(&pool, "u3", None).await;
            let ntype = seed_type(&pool, "order_shipped").await;
            PreferenceRepository::set_global(&pool, "u1", true).await.unwrap();
            PreferenceRepository::set_category(
                &pool,
                "u2",
                NotificationCategory::Transactional,
                true,
            )
            .await
            .unwrap();
            let resolver = PreferenceResolver::new(
                pool.clone(),
                Arc::new(MemoryPreferenceCache::new()),
                Duration::from_secs(300),
            );

            let user_ids = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
            let bulk = resolver.resolve_bulk(&user_ids, &ntype).await;

            assert_eq!(
                bulk["u1"].blocked_reason,
                Some(SkipReason::GlobalDisabled)
            );
            assert_eq!(
                bulk["u2"].blocked_reason,
                Some(SkipReason::CategoryDisabled)
            );
            assert!(bulk["u3"].allowed);
        }
    }
}
