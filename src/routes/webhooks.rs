use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};

use crate::error::AppError;
use crate::services::webhooks::{
    ingest_email_event, ingest_push_event, verify_signature, EmailWebhookEvent, PushWebhookEvent,
};
use crate::AppState;

const FCM_SIGNATURE_HEADER: &str = "x-fcm-signature";
const EMAIL_SIGNATURE_HEADER: &str = "x-email-signature";

/// Routes nested at `/webhooks`. Rate limiting is applied by the caller.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/fcm", post(handle_fcm_webhook))
        .route("/email", post(handle_email_webhook))
}

/// Authenticate the raw body against the shared secret. An unconfigured
/// secret rejects everything; webhooks must never be open.
fn authenticate(
    secret: Option<&String>,
    headers: &HeaderMap,
    header_name: &str,
    body: &[u8],
) -> Result<(), AppError> {
    let Some(secret) = secret else {
        tracing::warn!("Webhook secret not configured, rejecting request");
        return Err(AppError::Unauthorized);
    };
    let signature = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    if !verify_signature(secret, body, signature) {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

async fn handle_fcm_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), AppError> {
    authenticate(
        state.config.webhooks.fcm_secret.as_ref(),
        &headers,
        FCM_SIGNATURE_HEADER,
        &body,
    )?;

    let event: PushWebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {e}")))?;

    tracing::info!(
        "Received FCM webhook: message_id={}, event={}",
        event.message_id,
        event.event
    );

    // Verified events always answer OK; unknown or stale ones are logged
    // and dropped so the provider does not keep redelivering them.
    ingest_push_event(&state.db, &state.config.delivery, event).await?;
    Ok((StatusCode::OK, "OK"))
}

async fn handle_email_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), AppError> {
    authenticate(
        state.config.webhooks.email_secret.as_ref(),
        &headers,
        EMAIL_SIGNATURE_HEADER,
        &body,
    )?;

    let event: EmailWebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {e}")))?;

    tracing::info!(
        "Received email webhook: message_id={}, event={}",
        event.message_id,
        event.event
    );

    ingest_email_event(&state.db, &state.config.delivery, event).await?;
    Ok((StatusCode::OK, "OK"))
}
