use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use shared_config::AppConfig;

use crate::models::{
    ChangeEvent, Entity, FeedSpec, RawChange, SessionState, Subject, SubscriptionFilter,
    SyncSettings,
};
use crate::services::{
    realtime::SupabaseRealtimeSource,
    reconciler::Reconciler,
    snapshot::{SnapshotLoader, SupabaseSnapshotLoader},
    source::{ChangeEventSource, ChangeStream},
    views::{SyncView, ViewState},
};
use crate::SyncError;

/// Backends and tuning shared by every session of a manager.
#[derive(Clone)]
pub struct SyncSources {
    pub loader: Arc<dyn SnapshotLoader>,
    pub source: Arc<dyn ChangeEventSource>,
    pub settings: SyncSettings,
}

impl SyncSources {
    pub fn new(
        loader: Arc<dyn SnapshotLoader>,
        source: Arc<dyn ChangeEventSource>,
        settings: SyncSettings,
    ) -> Self {
        Self { loader, source, settings }
    }

    /// PostgREST snapshots plus Supabase Realtime changes.
    pub fn supabase(config: &AppConfig) -> Result<Self, SyncError> {
        Ok(Self {
            loader: Arc::new(SupabaseSnapshotLoader::new(config)),
            source: Arc::new(SupabaseRealtimeSource::new(config)?),
            settings: SyncSettings::from(config),
        })
    }
}

/// One subject bound to one reconciler and one live subscription.
///
/// All mutations run on a single spawned task in arrival order. `stop`
/// waits for that task, so nothing touches the reconciler once it returns.
pub struct SyncSession {
    subject: Subject,
    view: SyncView,
    shutdown: watch::Sender<bool>,
    access_token: watch::Sender<String>,
    started_at: Instant,
    last_access_ms: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn start(subject: Subject, access_token: String, feed: &FeedSpec, sources: SyncSources) -> Self {
        let (state_tx, state_rx) = watch::channel(ViewState::starting());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (token_tx, token_rx) = watch::channel(access_token);

        let worker = SessionWorker {
            subject: subject.clone(),
            filter: feed.filter_for(&subject),
            access_token: token_rx,
            sources,
            state_tx,
            reconciler: Reconciler::new(),
            state: SessionState::Starting,
            seq: 0,
            revision: 0,
            snapshot_loaded: false,
            connected: false,
        };

        let task = tokio::spawn(worker.run(shutdown_rx));

        Self {
            subject,
            view: SyncView::new(state_rx, &feed.read_flag),
            shutdown: shutdown_tx,
            access_token: token_tx,
            started_at: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn view(&self) -> SyncView {
        self.view.clone()
    }

    pub fn state(&self) -> SessionState {
        self.view.state()
    }

    /// Starting or Live.
    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Idle
    }

    /// Replaces the token used by the next snapshot and the next
    /// subscription attempt. Returns `true` if it differed.
    pub fn refresh_token(&self, access_token: &str) -> bool {
        self.access_token.send_if_modified(|current| {
            if current == access_token {
                return false;
            }
            *current = access_token.to_string();
            true
        })
    }

    /// Records a read, pushing back idle eviction.
    pub fn touch(&self) {
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.last_access_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last `touch`, or since start if never touched.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        self.started_at.elapsed().saturating_sub(last)
    }

    /// Tears the session down and waits until its task has exited.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Sync session for {} panicked: {}", self.subject, e);
                }
            }
            info!("Sync session for {} stopped", self.subject);
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

struct SessionWorker {
    subject: Subject,
    filter: SubscriptionFilter,
    access_token: watch::Receiver<String>,
    sources: SyncSources,
    state_tx: watch::Sender<ViewState>,
    reconciler: Reconciler,
    state: SessionState,
    seq: u64,
    revision: u64,
    snapshot_loaded: bool,
    connected: bool,
}

impl SessionWorker {
    #[instrument(skip_all, fields(subject = %self.subject, table = %self.filter.table))]
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting sync session");
        let mut delay = self.sources.settings.resubscribe_initial;

        'session: loop {
            if *shutdown.borrow() {
                break;
            }

            // The snapshot is requested while the subscription is still being
            // established, so an unavailable change source does not hold back
            // the collection. Events arriving later are newer than it.
            let mut snapshot_seq = self.seq;
            let mut load = self.request_snapshot();
            let mut snapshot_pending = true;

            let connect = subscribe_with_retry(
                Arc::clone(&self.sources.source),
                self.filter.clone(),
                self.access_token.clone(),
                self.sources.settings.clone(),
            );
            tokio::pin!(connect);

            let mut changes = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break 'session,
                    changes = &mut connect => break changes,
                    result = &mut load, if snapshot_pending => {
                        snapshot_pending = false;
                        self.handle_snapshot(result, snapshot_seq);
                    }
                }
            };

            delay = self.sources.settings.resubscribe_initial;
            self.connected = true;
            self.publish();

            if !snapshot_pending {
                // Rows written between that read and the join were never
                // delivered as events.
                debug!("Snapshot settled before the subscription, resyncing");
                snapshot_seq = self.seq;
                load = self.request_snapshot();
                snapshot_pending = true;
            }

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break 'session,
                    result = &mut load, if snapshot_pending => {
                        snapshot_pending = false;
                        self.handle_snapshot(result, snapshot_seq);
                    }
                    item = changes.next() => match item {
                        Some(Ok(change)) => {
                            let pending = snapshot_pending.then_some(snapshot_seq);
                            self.handle_change(change, pending);
                        }
                        Some(Err(e)) if e.requires_resubscribe() => {
                            warn!("Subscription dropped: {}", e);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("Dropping change: {}", e);
                        }
                        None => {
                            warn!("Subscription ended");
                            break;
                        }
                    },
                }
            }

            drop(changes);
            self.connected = false;
            self.publish();

            if !self.backoff(&mut delay, &mut shutdown).await {
                break;
            }
            info!("Resubscribing after drop");
        }

        self.connected = false;
        self.state = SessionState::Idle;
        self.publish();
        info!("Sync session ended");
    }

    fn request_snapshot(&self) -> BoxFuture<'static, Result<Vec<Value>, SyncError>> {
        load_snapshot(
            Arc::clone(&self.sources.loader),
            self.filter.clone(),
            self.access_token.borrow().clone(),
            self.sources.settings.snapshot_timeout,
        )
        .boxed()
    }

    fn handle_snapshot(&mut self, result: Result<Vec<Value>, SyncError>, snapshot_seq: u64) {
        match result {
            Ok(rows) => {
                let entities: Vec<Entity> = rows
                    .into_iter()
                    .filter_map(|row| match Entity::from_record(row) {
                        Ok(entity) => Some(entity),
                        Err(e) => {
                            warn!("Skipping snapshot row: {}", e);
                            None
                        }
                    })
                    .collect();

                self.reconciler.apply_snapshot(entities, snapshot_seq);
                self.snapshot_loaded = true;
            }
            Err(e) => {
                warn!("Snapshot unavailable, continuing with live events only: {}", e);
            }
        }

        // No snapshot is in flight any more.
        self.reconciler.compact(self.seq);
        self.state = SessionState::Live;
        self.publish();
    }

    /// Applies one change. `pending_snapshot` is the tag of the snapshot
    /// still in flight, if any; older versions are dropped afterwards.
    fn handle_change(&mut self, change: RawChange, pending_snapshot: Option<u64>) {
        let kind = change.kind;
        let entity = match Entity::from_record(change.record) {
            Ok(entity) => entity,
            Err(e) => {
                warn!("Dropping {:?} change: {}", kind, e);
                return;
            }
        };

        self.seq += 1;
        let event = ChangeEvent::new(kind, entity, self.seq);

        let changed = self.reconciler.apply_event(event);
        self.reconciler.compact(pending_snapshot.unwrap_or(self.seq));

        if changed {
            self.publish();
        } else {
            debug!("Change at seq {} left the collection unchanged", self.seq);
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.state_tx.send_replace(ViewState {
            state: self.state,
            entities: Arc::new(self.reconciler.entities().to_vec()),
            revision: self.revision,
            snapshot_loaded: self.snapshot_loaded,
            connected: self.connected,
        });
    }

    /// Sleeps for `delay` and doubles it up to the configured maximum.
    /// Returns `false` if shutdown was requested meanwhile.
    async fn backoff(&self, delay: &mut Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let wait = *delay;
        *delay = (*delay * 2).min(self.sources.settings.resubscribe_max);

        tokio::select! {
            biased;
            _ = shutdown.changed() => false,
            _ = sleep(wait) => !*shutdown.borrow(),
        }
    }
}

/// Subscribes until it succeeds, backing off exponentially between
/// attempts. Each attempt uses the latest access token.
async fn subscribe_with_retry(
    source: Arc<dyn ChangeEventSource>,
    filter: SubscriptionFilter,
    access_token: watch::Receiver<String>,
    settings: SyncSettings,
) -> ChangeStream {
    let mut delay = settings.resubscribe_initial;

    loop {
        let token = access_token.borrow().clone();
        match source.subscribe(&filter, &token).await {
            Ok(changes) => return changes,
            Err(e) => {
                warn!("Subscription failed: {}; retrying in {:?}", e, delay);
                sleep(delay).await;
                delay = (delay * 2).min(settings.resubscribe_max);
            }
        }
    }
}

async fn load_snapshot(
    loader: Arc<dyn SnapshotLoader>,
    filter: SubscriptionFilter,
    access_token: String,
    limit: Duration,
) -> Result<Vec<Value>, SyncError> {
    match timeout(limit, loader.load(&filter, &access_token)).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Fetch(format!("snapshot timed out after {:?}", limit))),
    }
}
