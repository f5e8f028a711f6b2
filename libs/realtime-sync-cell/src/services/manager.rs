use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::models::{FeedSpec, SessionState, Subject};
use crate::services::session::{SyncSession, SyncSources};
use crate::services::views::SyncView;

/// Owns the sync sessions of one feed, at most one per subject.
///
/// Display surfaces share a subject's session by reference through the
/// `SyncView` handed out by `start`.
pub struct SubscriptionManager {
    feed: FeedSpec,
    sources: SyncSources,
    sessions: Arc<RwLock<HashMap<Subject, Arc<SyncSession>>>>,
}

impl SubscriptionManager {
    pub fn new(feed: FeedSpec, sources: SyncSources) -> Self {
        Self {
            feed,
            sources,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn feed(&self) -> &FeedSpec {
        &self.feed
    }

    /// Starts syncing `subject`, or returns the running session's view.
    ///
    /// A running session picks up `access_token` for its next snapshot
    /// and resubscribe, and counts the call as a read.
    #[instrument(skip(self, access_token), fields(table = %self.feed.table))]
    pub async fn start(&self, subject: &Subject, access_token: &str) -> SyncView {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(subject) {
                if session.is_active() {
                    debug!("Session for {} already running", subject);
                    return Self::rejoin(session, access_token);
                }
            }
        }

        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(subject) {
            if existing.is_active() {
                return Self::rejoin(existing, access_token);
            }
            // Task ended on its own; replace it.
            existing.stop().await;
        }

        let session = Arc::new(SyncSession::start(
            subject.clone(),
            access_token.to_string(),
            &self.feed,
            self.sources.clone(),
        ));
        session.touch();
        let view = session.view();
        sessions.insert(subject.clone(), session);

        info!("Started {} sync for {}", self.feed.table, subject);
        view
    }

    fn rejoin(session: &SyncSession, access_token: &str) -> SyncView {
        if session.refresh_token(access_token) {
            debug!("Refreshed access token for {}", session.subject());
        }
        session.touch();
        session.view()
    }

    /// Tears down the subject's session. Returns `false` if none was running.
    pub async fn stop(&self, subject: &Subject) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(subject) {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Moves a consumer from `previous` to `next`, tearing the old session
    /// down before the new one starts. `None` on either side means logged out.
    pub async fn switch_subject(
        &self,
        previous: Option<&Subject>,
        next: Option<(&Subject, &str)>,
    ) -> Option<SyncView> {
        if let Some(previous) = previous {
            let unchanged = next.map(|(subject, _)| subject == previous).unwrap_or(false);
            if !unchanged {
                self.stop(previous).await;
            }
        }

        match next {
            Some((subject, access_token)) => Some(self.start(subject, access_token).await),
            None => None,
        }
    }

    pub async fn state(&self, subject: &Subject) -> SessionState {
        self.sessions
            .read()
            .await
            .get(subject)
            .map(|session| session.state())
            .unwrap_or(SessionState::Idle)
    }

    pub async fn view(&self, subject: &Subject) -> Option<SyncView> {
        self.sessions.read().await.get(subject).map(|session| session.view())
    }

    pub async fn active_subjects(&self) -> Vec<Subject> {
        let sessions = self.sessions.read().await;
        let mut subjects: Vec<Subject> = sessions
            .iter()
            .filter(|(_, session)| session.is_active())
            .map(|(subject, _)| subject.clone())
            .collect();
        subjects.sort();
        subjects
    }

    /// Stops sessions that have not been read for longer than `max_idle`
    /// and returns their subjects.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<Subject> {
        let mut sessions = self.sessions.write().await;

        let idle: Vec<Subject> = sessions
            .iter()
            .filter(|(_, session)| session.idle_for() > max_idle)
            .map(|(subject, _)| subject.clone())
            .collect();

        for subject in &idle {
            if let Some(session) = sessions.remove(subject) {
                session.stop().await;
            }
        }

        if !idle.is_empty() {
            info!("Evicted {} idle {} sessions", idle.len(), self.feed.table);
        }
        idle
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.stop().await;
        }
        info!("{} sync shut down, {} sessions stopped", self.feed.table, count);
    }
}
