use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{Notification, NotificationDelivery, NotificationType};
use crate::db::repository::{DeliveryRepository, NotificationRepository, NotificationTypeRepository};
use crate::error::{AppError, AppResult};
use crate::services::notifications::{
    BroadcastRequest, CreateNotificationRequest, CreatedNotification,
};
use crate::AppState;

/// Routes nested at `/api/notifications`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_notification))
        .route("/broadcast", post(create_broadcast))
        .route("/types", get(list_types))
        .route("/:id/deliveries", get(list_deliveries))
}

/// User-scoped routes nested at `/api/users/:user_id/notifications`.
pub fn user_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/unread-count", get(unread_count))
        .route("/mark-read", post(mark_read))
        .route("/mark-all-read", post(mark_all_read))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub unread_only: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsListResponse {
    pub items: Vec<Notification>,
    pub page: i64,
    pub per_page: i64,
    pub unread_count: i64,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkAllReadRequest {
    pub type_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub total: usize,
    pub created: usize,
    pub notifications: Vec<CreatedNotification>,
}

#[derive(Debug, Serialize)]
pub struct DeliveriesResponse {
    pub notification_id: String,
    pub deliveries: Vec<NotificationDelivery>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateNotificationRequest>,
) -> AppResult<(StatusCode, Json<CreatedNotification>)> {
    let result = state.notifications.create_notification(request).await?;
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

async fn create_broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> AppResult<(StatusCode, Json<BroadcastResponse>)> {
    if request.recipient_ids.is_empty() {
        return Err(AppError::Validation(
            "recipient_ids must not be empty".to_string(),
        ));
    }
    let results = state.notifications.create_broadcast(request).await?;
    let created = results.iter().filter(|r| r.created).count();
    Ok((
        StatusCode::CREATED,
        Json(BroadcastResponse {
            total: results.len(),
            created,
            notifications: results,
        }),
    ))
}

/// Catalogue of active notification types (operator reference).
async fn list_types(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<NotificationType>>> {
    let types = NotificationTypeRepository::list_active(&state.db).await?;
    Ok(Json(types))
}

/// Delivery audit trail for one notification.
async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<DeliveriesResponse>> {
    let notification = NotificationRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification '{id}' not found")))?;
    let deliveries = DeliveryRepository::list_for_notification(&state.db, &notification.id).await?;
    Ok(Json(DeliveriesResponse {
        notification_id: notification.id,
        deliveries,
    }))
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;
    let unread_only = query.unread_only.unwrap_or(false);

    let items = state
        .notifications
        .list_for_user(&user_id, per_page, offset, unread_only)
        .await?;
    let unread_count = state.notifications.unread_count(&user_id).await?;

    Ok(Json(NotificationsListResponse {
        items,
        page,
        per_page,
        unread_count,
    }))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<UnreadCountResponse>> {
    let unread_count = state.notifications.unread_count(&user_id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<MarkReadRequest>,
) -> AppResult<Json<MarkReadResponse>> {
    if request.ids.is_empty() {
        return Err(AppError::Validation("ids must not be empty".to_string()));
    }
    let updated = state
        .notifications
        .mark_as_read(&user_id, &request.ids)
        .await?;
    Ok(Json(MarkReadResponse { updated }))
}

async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<MarkAllReadRequest>,
) -> AppResult<Json<MarkReadResponse>> {
    let updated = state
        .notifications
        .mark_all_as_read(&user_id, request.type_key.as_deref())
        .await?;
    Ok(Json(MarkReadResponse { updated }))
}
