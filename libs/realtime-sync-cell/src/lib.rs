//! # Realtime Sync Cell
//!
//! Keeps a client-held, newest-first collection of backend rows in step with
//! the database for one subject (usually the logged-in user id).
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                 Realtime Sync Cell                  |
//! +-----------------------------------------------------+
//! |  models.rs       |  Subject, Entity, events, feeds  |
//! |  error.rs        |  SyncError taxonomy              |
//! |  services/                                          |
//! |    source.rs     |  ChangeEventSource + broadcast   |
//! |    realtime.rs   |  Supabase Realtime websocket     |
//! |    snapshot.rs   |  SnapshotLoader (PostgREST)      |
//! |    reconciler.rs |  snapshot + event merge          |
//! |    session.rs    |  per-subject sync task           |
//! |    manager.rs    |  one session per subject         |
//! |    views.rs      |  unread count, latest-N          |
//! +-----------------------------------------------------+
//! ```
//!
//! Data flows from the manager, which starts a session per subject. The
//! session loads the snapshot while it subscribes to the change source, and
//! feeds both into its reconciler. Views read the reconciled collection.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use realtime_sync_cell::{FeedSpec, Subject, SubscriptionManager, SyncSources};
//! use shared_config::AppConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env();
//! let manager = SubscriptionManager::new(FeedSpec::notifications(), SyncSources::supabase(&config)?);
//!
//! let view = manager.start(&Subject::from("user-id"), "access-token").await;
//! println!("unread: {}", view.unread_count());
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod models;
pub mod services;

pub use error::SyncError;
pub use models::{
    ChangeEvent, ChangeKind, Entity, FeedSpec, RawChange, SessionState, Subject,
    SubscriptionFilter, SyncSettings,
};
pub use services::{
    BroadcastEventSource, ChangeEventSource, ChangeStream, Reconciler, SnapshotLoader,
    SubscriptionManager, SupabaseRealtimeSource, SupabaseSnapshotLoader, SyncSession,
    SyncSources, SyncView, ViewState,
};
