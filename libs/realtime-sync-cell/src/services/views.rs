use std::sync::Arc;

use tokio::sync::watch;

use crate::models::{Entity, SessionState};
use crate::SyncError;

/// What a session publishes after every mutation.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub state: SessionState,
    pub entities: Arc<Vec<Entity>>,
    pub revision: u64,
    pub snapshot_loaded: bool,
    pub connected: bool,
}

impl ViewState {
    pub fn starting() -> Self {
        Self {
            state: SessionState::Starting,
            entities: Arc::new(Vec::new()),
            revision: 0,
            snapshot_loaded: false,
            connected: false,
        }
    }
}

/// Number of entities whose read flag is not `true`. A missing flag counts as unread.
pub fn unread_count(entities: &[Entity], read_flag: &str) -> usize {
    entities
        .iter()
        .filter(|e| e.flag(read_flag) != Some(true))
        .count()
}

/// The first `n` entities, i.e. the `n` most recent.
pub fn latest(entities: &[Entity], n: usize) -> Vec<Entity> {
    entities.iter().take(n).cloned().collect()
}

/// Read-only handle onto a session's reconciled collection.
///
/// Every accessor projects the latest published state, so a view can never
/// disagree with the collection it was taken from.
#[derive(Debug, Clone)]
pub struct SyncView {
    rx: watch::Receiver<ViewState>,
    read_flag: Arc<str>,
}

impl SyncView {
    pub fn new(rx: watch::Receiver<ViewState>, read_flag: &str) -> Self {
        Self {
            rx,
            read_flag: Arc::from(read_flag),
        }
    }

    pub fn current(&self) -> ViewState {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.rx.borrow().state
    }

    pub fn revision(&self) -> u64 {
        self.rx.borrow().revision
    }

    pub fn snapshot_loaded(&self) -> bool {
        self.rx.borrow().snapshot_loaded
    }

    pub fn is_connected(&self) -> bool {
        self.rx.borrow().connected
    }

    pub fn entities(&self) -> Arc<Vec<Entity>> {
        Arc::clone(&self.rx.borrow().entities)
    }

    pub fn unread_count(&self) -> usize {
        unread_count(&self.rx.borrow().entities, &self.read_flag)
    }

    pub fn latest(&self, n: usize) -> Vec<Entity> {
        latest(&self.rx.borrow().entities, n)
    }

    pub fn first(&self) -> Option<Entity> {
        self.rx.borrow().entities.first().cloned()
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.rx.borrow().entities.iter().find(|e| e.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rx.borrow().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.borrow().entities.is_empty()
    }

    /// Waits for the next published mutation.
    pub async fn changed(&mut self) -> Result<(), SyncError> {
        self.rx.changed().await.map_err(|_| SyncError::SessionClosed)
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_until<F>(&mut self, mut predicate: F) -> Result<ViewState, SyncError>
    where
        F: FnMut(&ViewState) -> bool,
    {
        let state = self
            .rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        Ok(state.clone())
    }
}
