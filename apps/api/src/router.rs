use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use notification_cell::router::notification_routes;
use notification_cell::services::NotificationService;
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>, notifications: Arc<NotificationService>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic sync API is running!" }))
        .merge(notification_routes(state, notifications))
}
