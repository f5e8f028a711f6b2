use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use realtime_sync_cell::{Entity, SessionState};
use shared_models::auth::DashboardRole;
use shared_models::error::AppError;

pub const DEFAULT_NOTIFICATION_LIMIT: usize = 10;
pub const MAX_NOTIFICATION_LIMIT: usize = 100;

/// Typed projection of a `notifications` row.
///
/// Only `id` is guaranteed; everything else is optional so a partially
/// populated row still renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(skip_deserializing)]
    pub id: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        match serde_json::from_value::<Notification>(entity.to_value()) {
            Ok(mut notification) => {
                notification.id = entity.id().to_string();
                Some(notification)
            }
            Err(e) => {
                warn!("Skipping notification {}: {}", entity.id(), e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(skip_deserializing)]
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        match serde_json::from_value::<Profile>(entity.to_value()) {
            Ok(mut profile) => {
                profile.id = entity.id().to_string();
                Some(profile)
            }
            Err(e) => {
                warn!("Skipping profile {}: {}", entity.id(), e);
                None
            }
        }
    }

    pub fn dashboard_role(&self) -> Option<DashboardRole> {
        self.role.as_deref().and_then(DashboardRole::parse)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationListQuery {
    pub limit: Option<usize>,
}

impl NotificationListQuery {
    /// Requested page size, defaulted and clamped to `1..=MAX_NOTIFICATION_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_NOTIFICATION_LIMIT)
            .clamp(1, MAX_NOTIFICATION_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub total: usize,
    pub state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileResponse {
    pub profile: Option<Profile>,
    pub role: Option<DashboardRole>,
    pub state: SessionState,
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Notification backend error: {0}")]
    Backend(String),
}

impl From<NotificationError> for AppError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::NotFound(id) => AppError::NotFound(format!("Notification {} not found", id)),
            NotificationError::Backend(msg) => AppError::ExternalService(msg),
        }
    }
}
