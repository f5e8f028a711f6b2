#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use realtime_sync_cell::*;

/// Snapshot loader serving canned rows, optionally slow or failing.
pub struct StaticSnapshotLoader {
    rows: Mutex<Vec<Value>>,
    delay: Mutex<Option<Duration>>,
    failure: Mutex<Option<SyncError>>,
    tokens: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl StaticSnapshotLoader {
    pub fn new(rows: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
            delay: Mutex::new(None),
            failure: Mutex::new(None),
            tokens: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(error: SyncError) -> Arc<Self> {
        let loader = Self::new(Vec::new());
        *loader.failure.lock().unwrap() = Some(error);
        loader
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Access tokens seen by each load, in call order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotLoader for StaticSnapshotLoader {
    async fn load(&self, _filter: &SubscriptionFilter, access_token: &str) -> Result<Vec<Value>, SyncError> {
        self.tokens.lock().unwrap().push(access_token.to_string());
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.rows.lock().unwrap().clone()),
        }
    }
}

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        snapshot_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(30),
        resubscribe_initial: Duration::from_millis(10),
        resubscribe_max: Duration::from_millis(50),
        idle_ttl: Duration::from_secs(900),
        sweep_interval: Duration::from_secs(60),
    }
}

pub fn sources(loader: Arc<StaticSnapshotLoader>, source: &BroadcastEventSource) -> SyncSources {
    SyncSources::new(loader, Arc::new(source.clone()), test_settings())
}

pub fn notification(id: &str, is_read: bool) -> Value {
    json!({
        "id": id,
        "recipient_id": "u1",
        "title": "Appointment confirmed",
        "is_read": is_read,
        "created_at": "2024-05-01T10:00:00Z"
    })
}

pub fn ids(view: &SyncView) -> Vec<String> {
    view.entities().iter().map(|e| e.id().to_string()).collect()
}

/// Waits up to two seconds for the view to satisfy `predicate`.
pub async fn wait_for<F>(view: &SyncView, predicate: F) -> ViewState
where
    F: FnMut(&ViewState) -> bool,
{
    let mut view = view.clone();
    timeout(Duration::from_secs(2), view.wait_until(predicate))
        .await
        .expect("view did not reach expected state in time")
        .expect("session closed while waiting")
}

/// Waits until a subscriber is attached to `filter`.
pub async fn wait_for_subscriber(source: &BroadcastEventSource, filter: &SubscriptionFilter) {
    timeout(Duration::from_secs(2), async {
        while source.subscriber_count(filter).await == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no subscriber attached in time");
}

/// Waits up to two seconds for the loader to have been called `count` times.
pub async fn wait_for_calls(loader: &StaticSnapshotLoader, count: usize) {
    timeout(Duration::from_secs(2), async {
        while loader.calls() < count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("snapshot loader not called in time");
}
