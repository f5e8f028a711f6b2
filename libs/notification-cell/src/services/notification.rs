use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, instrument};

use realtime_sync_cell::services::unread_count;
use realtime_sync_cell::{
    Entity, FeedSpec, SessionState, Subject, SubscriptionManager, SyncError, SyncSources, SyncView,
};
use shared_config::AppConfig;
use shared_database::supabase::{RestQuery, SupabaseClient};
use shared_models::auth::User;

use crate::models::{
    Notification, NotificationError, NotificationListResponse, Profile, ProfileResponse,
};

/// Notification panel and profile state for dashboard users.
///
/// Reads come from the per-user sync sessions; writes go to PostgREST and
/// reach the sessions back through the change feed.
pub struct NotificationService {
    notifications: SubscriptionManager,
    profiles: SubscriptionManager,
    supabase: SupabaseClient,
    ready_timeout: Duration,
    idle_ttl: Duration,
    sweep_interval: Duration,
}

impl NotificationService {
    pub fn new(config: &AppConfig) -> Result<Self, SyncError> {
        Ok(Self::with_sources(config, SyncSources::supabase(config)?))
    }

    pub fn with_sources(config: &AppConfig, sources: SyncSources) -> Self {
        let ready_timeout = sources.settings.snapshot_timeout;
        let idle_ttl = sources.settings.idle_ttl;
        let sweep_interval = sources.settings.sweep_interval;

        Self {
            notifications: SubscriptionManager::new(FeedSpec::notifications(), sources.clone()),
            profiles: SubscriptionManager::new(FeedSpec::profiles(), sources),
            supabase: SupabaseClient::new(config),
            ready_timeout,
            idle_ttl,
            sweep_interval,
        }
    }

    pub fn notifications(&self) -> &SubscriptionManager {
        &self.notifications
    }

    pub fn profiles(&self) -> &SubscriptionManager {
        &self.profiles
    }

    /// Starts (or joins) the user's session and waits, at most one snapshot
    /// timeout, for the first snapshot to settle.
    async fn ready_view(&self, manager: &SubscriptionManager, user: &User, auth_token: &str) -> SyncView {
        let mut view = manager.start(&Subject::from(user.id.as_str()), auth_token).await;

        if view.state() == SessionState::Starting {
            let settled = timeout(
                self.ready_timeout,
                view.wait_until(|state| state.state != SessionState::Starting),
            )
            .await;

            if settled.is_err() {
                debug!("Session for {} still starting, serving current collection", user.id);
            }
        }

        view
    }

    #[instrument(skip(self, user, auth_token), fields(user_id = %user.id))]
    pub async fn latest(&self, user: &User, auth_token: &str, limit: usize) -> NotificationListResponse {
        let view = self.ready_view(&self.notifications, user, auth_token).await;
        let current = view.current();

        let notifications = current
            .entities
            .iter()
            .filter_map(Notification::from_entity)
            .take(limit)
            .collect();

        NotificationListResponse {
            notifications,
            unread_count: unread_count(&current.entities, &self.notifications.feed().read_flag),
            total: current.entities.len(),
            state: current.state,
        }
    }

    pub async fn unread_count(&self, user: &User, auth_token: &str) -> usize {
        self.ready_view(&self.notifications, user, auth_token)
            .await
            .unread_count()
    }

    /// Marks one of the user's notifications as read.
    pub async fn mark_read(&self, notification_id: &str, user: &User, auth_token: &str) -> Result<Notification, NotificationError> {
        debug!("Marking notification {} read for {}", notification_id, user.id);

        let query = RestQuery::table("notifications")
            .eq("id", notification_id)
            .eq("recipient_id", &user.id);

        let rows = self
            .supabase
            .update(&query, json!({ "is_read": true }), auth_token)
            .await
            .map_err(|e| NotificationError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .and_then(|row| Entity::from_record(row).ok())
            .and_then(|entity| Notification::from_entity(&entity))
            .ok_or_else(|| NotificationError::NotFound(notification_id.to_string()))
    }

    /// Marks every unread notification of the user as read. Returns how many changed.
    pub async fn mark_all_read(&self, user: &User, auth_token: &str) -> Result<usize, NotificationError> {
        let query = RestQuery::table("notifications")
            .eq("recipient_id", &user.id)
            .eq("is_read", "false");

        let rows = self
            .supabase
            .update(&query, json!({ "is_read": true }), auth_token)
            .await
            .map_err(|e| NotificationError::Backend(e.to_string()))?;

        info!("Marked {} notifications read for {}", rows.len(), user.id);
        Ok(rows.len())
    }

    pub async fn profile(&self, user: &User, auth_token: &str) -> ProfileResponse {
        let view = self.ready_view(&self.profiles, user, auth_token).await;

        let profile = view
            .get(&user.id)
            .or_else(|| view.first())
            .and_then(|entity| Profile::from_entity(&entity));

        ProfileResponse {
            role: profile
                .as_ref()
                .and_then(Profile::dashboard_role)
                .or_else(|| user.dashboard_role()),
            profile,
            state: view.state(),
        }
    }

    /// Tears down both of the user's sessions. Returns `false` if neither was running.
    pub async fn sign_out(&self, user: &User) -> bool {
        let subject = Subject::from(user.id.as_str());

        let notifications = self.notifications.stop(&subject).await;
        let profiles = self.profiles.stop(&subject).await;

        info!("Signed out {}", user.id);
        notifications || profiles
    }

    /// Tears down sessions of both feeds that saw no read within the idle TTL.
    /// Returns how many were stopped.
    pub async fn evict_idle(&self) -> usize {
        let notifications = self.notifications.evict_idle(self.idle_ttl).await;
        let profiles = self.profiles.evict_idle(self.idle_ttl).await;

        notifications.len() + profiles.len()
    }

    /// Runs `evict_idle` every sweep interval until the service is dropped.
    pub fn spawn_idle_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let Some(service) = weak.upgrade() else {
                    break;
                };
                let evicted = service.evict_idle().await;
                if evicted > 0 {
                    debug!("Idle sweep stopped {} sessions", evicted);
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.notifications.shutdown().await;
        self.profiles.shutdown().await;
    }
}
