use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;

use crate::db::models::{DeviceToken, RegisterDeviceToken};
use crate::db::repository::{DeviceTokenRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::AppState;

/// Routes nested at `/api/devices`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(register_device))
        .route("/:user_id", get(list_devices))
        .route("/:user_id/:device_id", delete(unregister_device))
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceToken>,
}

async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterDeviceToken>,
) -> AppResult<(StatusCode, Json<DeviceToken>)> {
    if request.token.is_empty() {
        return Err(AppError::Validation("token must not be empty".to_string()));
    }
    if request.device_id.is_empty() {
        return Err(AppError::Validation(
            "device_id must not be empty".to_string(),
        ));
    }
    UserRepository::find_by_id(&state.db, &request.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User '{}' not found", request.user_id)))?;

    let device = DeviceTokenRepository::register(&state.db, request).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<DevicesResponse>> {
    let devices = DeviceTokenRepository::find_active_for_user(&state.db, &user_id).await?;
    Ok(Json(DevicesResponse { devices }))
}

async fn unregister_device(
    State(state): State<Arc<AppState>>,
    Path((user_id, device_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let deactivated = DeviceTokenRepository::deactivate(&state.db, &user_id, &device_id).await?;
    if !deactivated {
        return Err(AppError::NotFound(format!(
            "No active device '{device_id}' for user '{user_id}'"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}
