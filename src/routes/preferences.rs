use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::models::{
    NotificationCategory, UpdateTypePreference, UserCategoryPreference, UserGlobalPreference,
    UserTypePreference,
};
use crate::db::repository::{NotificationTypeRepository, PreferenceRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::services::preferences::PreferenceResolver;
use crate::AppState;

/// Routes nested at `/api/users/:user_id/preferences`. Every mutation
/// invalidates the user's cached resolutions before answering, so a
/// follow-up notification sees the new settings immediately.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_preferences))
        .route("/", put(bulk_update))
        .route("/", delete(reset_preferences))
        .route("/global", put(set_global))
        .route("/categories/:category", put(set_category))
        .route("/types/:type_key", put(set_type))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PreferencesResponse {
    pub global: Option<UserGlobalPreference>,
    pub categories: Vec<UserCategoryPreference>,
    pub types: Vec<UserTypePreference>,
}

#[derive(Debug, Deserialize)]
pub struct SetGlobalRequest {
    pub all_disabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetCategoryRequest {
    pub disabled: bool,
}

/// Combined update across all three hierarchy layers. Absent sections are
/// left untouched.
#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    #[serde(default)]
    pub global: Option<SetGlobalRequest>,
    #[serde(default)]
    pub categories: Vec<BulkCategoryUpdate>,
    #[serde(default)]
    pub types: Vec<BulkTypeUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct BulkCategoryUpdate {
    pub category: String,
    pub disabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkTypeUpdate {
    pub type_key: String,
    pub preferences: UpdateTypePreference,
}

// ============================================================================
// Handlers
// ============================================================================

async fn ensure_user(state: &AppState, user_id: &str) -> AppResult<()> {
    UserRepository::find_by_id(&state.db, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User '{user_id}' not found")))?;
    Ok(())
}

async fn load_preferences(pool: &SqlitePool, user_id: &str) -> AppResult<PreferencesResponse> {
    let global = PreferenceRepository::find_global(pool, user_id).await?;
    let categories = PreferenceRepository::list_categories(pool, user_id).await?;
    let types = PreferenceRepository::list_types(pool, user_id).await?;
    Ok(PreferencesResponse {
        global,
        categories,
        types,
    })
}

async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<PreferencesResponse>> {
    ensure_user(&state, &user_id).await?;
    Ok(Json(load_preferences(&state.db, &user_id).await?))
}

/// Apply a combined update, then drop the user's cached resolutions once.
/// Every name is validated before anything is written, so a bad category or
/// type key leaves the stored preferences untouched.
async fn apply_bulk_update(
    pool: &SqlitePool,
    resolver: &PreferenceResolver,
    user_id: &str,
    request: BulkUpdateRequest,
) -> AppResult<()> {
    let mut categories = Vec::with_capacity(request.categories.len());
    for update in &request.categories {
        let category = NotificationCategory::parse(&update.category).ok_or_else(|| {
            AppError::Validation(format!("Unknown category '{}'", update.category))
        })?;
        categories.push((category, update.disabled));
    }
    let mut types = Vec::with_capacity(request.types.len());
    for update in request.types {
        let ntype = NotificationTypeRepository::find_by_key(pool, &update.type_key)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No notification type with key '{}'",
                    update.type_key
                ))
            })?;
        types.push((ntype.id, update.preferences));
    }

    if let Some(global) = request.global {
        PreferenceRepository::set_global(pool, user_id, global.all_disabled).await?;
    }
    for (category, disabled) in categories {
        PreferenceRepository::set_category(pool, user_id, category, disabled).await?;
    }
    for (type_id, update) in types {
        PreferenceRepository::set_type(pool, user_id, &type_id, update).await?;
    }

    resolver.invalidate_user(user_id).await;
    Ok(())
}

async fn bulk_update(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<BulkUpdateRequest>,
) -> AppResult<Json<PreferencesResponse>> {
    ensure_user(&state, &user_id).await?;
    apply_bulk_update(&state.db, &state.resolver, &user_id, request).await?;
    Ok(Json(load_preferences(&state.db, &user_id).await?))
}

async fn set_global(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<SetGlobalRequest>,
) -> AppResult<Json<UserGlobalPreference>> {
    ensure_user(&state, &user_id).await?;
    let preference =
        PreferenceRepository::set_global(&state.db, &user_id, request.all_disabled).await?;
    state.resolver.invalidate_user(&user_id).await;
    Ok(Json(preference))
}

async fn set_category(
    State(state): State<Arc<AppState>>,
    Path((user_id, category)): Path<(String, String)>,
    Json(request): Json<SetCategoryRequest>,
) -> AppResult<Json<UserCategoryPreference>> {
    ensure_user(&state, &user_id).await?;
    let category = NotificationCategory::parse(&category)
        .ok_or_else(|| AppError::Validation(format!("Unknown category '{category}'")))?;
    let preference =
        PreferenceRepository::set_category(&state.db, &user_id, category, request.disabled)
            .await?;
    state.resolver.invalidate_user(&user_id).await;
    Ok(Json(preference))
}

async fn set_type(
    State(state): State<Arc<AppState>>,
    Path((user_id, type_key)): Path<(String, String)>,
    Json(request): Json<UpdateTypePreference>,
) -> AppResult<Json<UserTypePreference>> {
    ensure_user(&state, &user_id).await?;
    let ntype = NotificationTypeRepository::find_by_key(&state.db, &type_key)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No notification type with key '{type_key}'"))
        })?;
    let preference =
        PreferenceRepository::set_type(&state.db, &user_id, &ntype.id, request).await?;
    state.resolver.invalidate_user(&user_id).await;
    Ok(Json(preference))
}

/// Delete every preference row for the user, returning them to defaults.
async fn reset_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<StatusCode> {
    ensure_user(&state, &user_id).await?;
    PreferenceRepository::delete_all_for_user(&state.db, &user_id).await?;
    state.resolver.invalidate_user(&user_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::models::SkipReason;
    use crate::db::test_support::{seed_type, seed_user, setup_pool};
    use crate::services::preferences::MemoryPreferenceCache;

    fn resolver(pool: &SqlitePool) -> PreferenceResolver {
        PreferenceResolver::new(
            pool.clone(),
            Arc::new(MemoryPreferenceCache::new()),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn bulk_update_applies_every_layer_and_invalidates_cache() {
        let pool = setup_pool().await;
        seed_user(&pool, "u1", None).await;
        let ntype = seed_type(&pool, "order_shipped").await;
        let resolver = resolver(&pool);

        // Warm the cache with the default-allow resolution.
        assert!(resolver.resolve("u1", &ntype, true).await.allowed);

        let request = BulkUpdateRequest {
            global: Some(SetGlobalRequest {
                all_disabled: false,
            }),
            categories: vec![BulkCategoryUpdate {
                category: "transactional".to_string(),
                disabled: false,
            }],
            types: vec![BulkTypeUpdate {
                type_key: "order_shipped".to_string(),
                preferences: UpdateTypePreference {
                    disabled: Some(true),
                    ..Default::default()
                },
            }],
        };
        apply_bulk_update(&pool, &resolver, "u1", request)
            .await
            .unwrap();

        assert!(PreferenceRepository::find_global(&pool, "u1")
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            PreferenceRepository::list_categories(&pool, "u1")
                .await
                .unwrap()
                .len(),
            1
        );

        // A cached resolution would still say allowed; the bulk update
        // must have dropped it.
        let resolved = resolver.resolve("u1", &ntype, true).await;
        assert!(!resolved.allowed);
        assert_eq!(resolved.blocked_reason, Some(SkipReason::TypeDisabled));
    }

    #[tokio::test]
    async fn bulk_update_rejects_unknown_names_without_writing() {
        let pool = setup_pool().await;
        seed_user(&pool, "u1", None).await;
        seed_type(&pool, "order_shipped").await;
        let resolver = resolver(&pool);

        let request = BulkUpdateRequest {
            global: Some(SetGlobalRequest { all_disabled: true }),
            categories: vec![BulkCategoryUpdate {
                category: "no_such_category".to_string(),
                disabled: true,
            }],
            types: vec![],
        };
        let err = apply_bulk_update(&pool, &resolver, "u1", request)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Validation happens before any write lands.
        assert!(PreferenceRepository::find_global(&pool, "u1")
            .await
            .unwrap()
            .is_none());

        let request = BulkUpdateRequest {
            global: Some(SetGlobalRequest { all_disabled: true }),
            categories: vec![],
            types: vec![BulkTypeUpdate {
                type_key: "no_such_type".to_string(),
                preferences: UpdateTypePreference::default(),
            }],
        };
        let err = apply_bulk_update(&pool, &resolver, "u1", request)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(PreferenceRepository::find_global(&pool, "u1")
            .await
            .unwrap()
            .is_none());
    }
}
