use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Extension, Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::*;
use crate::services::NotificationService;

pub fn notification_routes(config: Arc<AppConfig>, service: Arc<NotificationService>) -> Router {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(get_unread_count))
        .route("/notifications/{id}/read", patch(mark_notification_read))
        .route("/notifications/read-all", post(mark_all_notifications_read))
        .route("/profile", get(get_profile))
        .route("/session", delete(end_session))
        .layer(Extension(service))
        .layer(middleware::from_fn_with_state(config.clone(), auth_middleware))
        .with_state(config)
}
