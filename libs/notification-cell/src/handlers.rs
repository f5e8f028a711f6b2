use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use serde_json::{json, Value};

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::AccessToken;

use crate::models::NotificationListQuery;
use crate::services::NotificationService;

#[axum::debug_handler]
pub async fn list_notifications(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Extension(token): Extension<AccessToken>,
    Query(query): Query<NotificationListQuery>,
) -> Result<Json<Value>, AppError> {
    let response = service
        .latest(&user, token.as_str(), query.effective_limit())
        .await;

    Ok(Json(json!(response)))
}

#[axum::debug_handler]
pub async fn get_unread_count(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Extension(token): Extension<AccessToken>,
) -> Result<Json<Value>, AppError> {
    let count = service.unread_count(&user, token.as_str()).await;

    Ok(Json(json!({ "unread_count": count })))
}

#[axum::debug_handler]
pub async fn mark_notification_read(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Extension(token): Extension<AccessToken>,
    Path(notification_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if notification_id.trim().is_empty() {
        return Err(AppError::BadRequest("Notification id is required".to_string()));
    }

    let notification = service
        .mark_read(&notification_id, &user, token.as_str())
        .await?;

    Ok(Json(json!(notification)))
}

#[axum::debug_handler]
pub async fn mark_all_notifications_read(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Extension(token): Extension<AccessToken>,
) -> Result<Json<Value>, AppError> {
    let updated = service.mark_all_read(&user, token.as_str()).await?;

    Ok(Json(json!({ "updated": updated })))
}

#[axum::debug_handler]
pub async fn get_profile(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Extension(token): Extension<AccessToken>,
) -> Result<Json<Value>, AppError> {
    let response = service.profile(&user, token.as_str()).await;

    Ok(Json(json!(response)))
}

/// Logout: releases the user's live subscriptions.
#[axum::debug_handler]
pub async fn end_session(
    Extension(service): Extension<Arc<NotificationService>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let stopped = service.sign_out(&user).await;

    Ok(Json(json!({
        "signed_out": true,
        "sessions_stopped": stopped
    })))
}
