use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Snapshot load failed or timed out. The session continues with what it has.
    #[error("Snapshot fetch failed: {0}")]
    Fetch(String),

    /// The change subscription could not be established or was dropped.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A change or row without a usable `id`. Dropped and logged.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Realtime sync not configured: {0}")]
    Configuration(String),

    #[error("Sync session closed")]
    SessionClosed,
}

impl SyncError {
    /// Errors that end the current subscription and require resubscribing.
    pub fn requires_resubscribe(&self) -> bool {
        matches!(self, SyncError::Subscription(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Subscription(err.to_string())
    }
}
