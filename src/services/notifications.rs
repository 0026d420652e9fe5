use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::models::{CreateNotification, Notification, NotificationType, SourceRef};
use crate::db::repository::{NotificationRepository, NotificationTypeRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::services::dispatch::DeliveryDispatcher;
use crate::services::preferences::PreferenceResolver;

/// Substitute `{placeholder}` markers with values from the payload.
///
/// Missing keys render as empty strings so a sparse payload never blocks
/// delivery. Unterminated braces are kept verbatim.
pub fn render_template(template: &str, data: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match data.get(key) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(serde_json::Value::Null) | None => {}
                    Some(value) => out.push_str(&value.to_string()),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationRequest {
    pub recipient_id: String,
    pub type_key: String,
    /// Explicit content wins over the type's templates.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastRequest {
    pub recipient_ids: Vec<String>,
    pub type_key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedNotification {
    pub notification: Notification,
    /// False when an idempotency key matched an existing notification.
    pub created: bool,
}

/// The notification factory: looks the type up, renders templates, persists
/// exactly one row per idempotency key and kicks off delivery.
pub struct NotificationService {
    pool: SqlitePool,
    resolver: Arc<PreferenceResolver>,
    dispatcher: Arc<DeliveryDispatcher>,
}

impl NotificationService {
    pub fn new(
        pool: SqlitePool,
        resolver: Arc<PreferenceResolver>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        Self {
            pool,
            resolver,
            dispatcher,
        }
    }

    pub async fn create_notification(
        &self,
        request: CreateNotificationRequest,
    ) -> AppResult<CreatedNotification> {
        let ntype = NotificationTypeRepository::find_active_by_key(&self.pool, &request.type_key)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No active notification type with key '{}'",
                    request.type_key
                ))
            })?;
        UserRepository::find_by_id(&self.pool, &request.recipient_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("User '{}' not found", request.recipient_id))
            })?;

        let (notification, created) = self
            .persist(&ntype, &request.recipient_id, &request, request.idempotency_key.clone())
            .await?;

        if created {
            self.spawn_dispatch(notification.clone(), ntype);
        }

        Ok(CreatedNotification {
            notification,
            created,
        })
    }

    /// Create one notification per recipient with per-user preference
    /// resolution batched into three queries. Unknown recipients are
    /// skipped with a warning rather than failing the whole broadcast.
    pub async fn create_broadcast(
        &self,
        request: BroadcastRequest,
    ) -> AppResult<Vec<CreatedNotification>> {
        let ntype = NotificationTypeRepository::find_active_by_key(&self.pool, &request.type_key)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No active notification type with key '{}'",
                    request.type_key
                ))
            })?;

        let mut results = Vec::with_capacity(request.recipient_ids.len());
        for recipient_id in &request.recipient_ids {
            if UserRepository::find_by_id(&self.pool, recipient_id)
                .await?
                .is_none()
            {
                tracing::warn!("Broadcast skipping unknown recipient {}", recipient_id);
                continue;
            }

            // Per-user key so one broadcast key dedupes each recipient
            // independently.
            let idempotency_key = request
                .idempotency_key
                .as_ref()
                .map(|key| format!("{key}:{recipient_id}"));
            let single = CreateNotificationRequest {
                recipient_id: recipient_id.clone(),
                type_key: request.type_key.clone(),
                title: request.title.clone(),
                body: request.body.clone(),
                actor_id: request.actor_id.clone(),
                data: request.data.clone(),
                source: request.source.clone(),
                idempotency_key: idempotency_key.clone(),
            };
            let (notification, created) = self
                .persist(&ntype, recipient_id, &single, idempotency_key)
                .await?;
            results.push(CreatedNotification {
                notification,
                created,
            });
        }

        // Resolve everyone in bulk, then fan deliveries out.
        let new_recipients: Vec<String> = results
            .iter()
            .filter(|r| r.created)
            .map(|r| r.notification.recipient_id.clone())
            .collect();
        let resolved = self.resolver.resolve_bulk(&new_recipients, &ntype).await;

        for result in results.iter().filter(|r| r.created) {
            let Some(prefs) = resolved.get(&result.notification.recipient_id) else {
                continue;
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            let notification = result.notification.clone();
            let ntype = ntype.clone();
            let prefs = prefs.clone();
            tokio::spawn(async move {
                if let Err(err) = dispatcher.dispatch(&notification, &ntype, &prefs).await {
                    tracing::error!(
                        "Dispatch failed for notification {}: {}",
                        notification.id,
                        err
                    );
                }
            });
        }

        Ok(results)
    }

    async fn persist(
        &self,
        ntype: &NotificationType,
        recipient_id: &str,
        request: &CreateNotificationRequest,
        idempotency_key: Option<String>,
    ) -> AppResult<(Notification, bool)> {
        let title = match &request.title {
            Some(title) => title.clone(),
            None => render_template(&ntype.title_template, &request.data),
        };
        let body = match &request.body {
            Some(body) => body.clone(),
            None => render_template(&ntype.body_template, &request.data),
        };
        let data_json = serde_json::to_string(&request.data)
            .map_err(|err| AppError::Internal(err.into()))?;

        let input = CreateNotification {
            recipient_id: recipient_id.to_string(),
            actor_id: request.actor_id.clone(),
            type_id: ntype.id.clone(),
            title,
            body,
            data_json,
            source: request.source.clone(),
            idempotency_key: idempotency_key.clone(),
        };

        match NotificationRepository::create(&self.pool, input).await {
            Ok(notification) => Ok((notification, true)),
            Err(err) if err.is_unique_violation() => {
                let Some(key) = idempotency_key else {
                    return Err(err);
                };
                // Lost the race (or a straight duplicate request); hand back
                // the winner.
                let existing = NotificationRepository::find_by_idempotency_key(&self.pool, &key)
                    .await?
                    .ok_or(err)?;
                tracing::debug!(
                    "Idempotency key '{}' matched existing notification {}",
                    key,
                    existing.id
                );
                Ok((existing, false))
            }
            Err(err) => Err(err),
        }
    }

    fn spawn_dispatch(&self, notification: Notification, ntype: NotificationType) {
        let resolver = Arc::clone(&self.resolver);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let resolved = resolver
                .resolve(&notification.recipient_id, &ntype, true)
                .await;
            if let Err(err) = dispatcher.dispatch(&notification, &ntype, &resolved).await {
                tracing::error!(
                    "Dispatch failed for notification {}: {}",
                    notification.id,
                    err
                );
            }
        });
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
        unread_only: bool,
    ) -> AppResult<Vec<Notification>> {
        NotificationRepository::list_for_user(&self.pool, user_id, limit, offset, unread_only).await
    }

    pub async fn unread_count(&self, user_id: &str) -> AppResult<i64> {
        NotificationRepository::count_for_user(&self.pool, user_id, true).await
    }

    pub async fn mark_as_read(&self, user_id: &str, ids: &[String]) -> AppResult<u64> {
        NotificationRepository::mark_as_read(&self.pool, user_id, ids).await
    }

    pub async fn mark_all_as_read(
        &self,
        user_id: &str,
        type_key: Option<&str>,
    ) -> AppResult<u64> {
        let type_id = match type_key {
            Some(key) => {
                let ntype = NotificationTypeRepository::find_by_key(&self.pool, key)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("No notification type with key '{key}'"))
                    })?;
                Some(ntype.id)
            }
            None => None,
        };
        NotificationRepository::mark_all_as_read(&self.pool, user_id, type_id.as_deref()).await
    }
}
