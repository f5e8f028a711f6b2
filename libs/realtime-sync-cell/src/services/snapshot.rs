use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use shared_config::AppConfig;
use shared_database::supabase::{RestQuery, SupabaseClient};

use crate::models::SubscriptionFilter;
use crate::SyncError;

/// Initial bulk read of the rows matching a filter, newest first.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn load(
        &self,
        filter: &SubscriptionFilter,
        access_token: &str,
    ) -> Result<Vec<Value>, SyncError>;
}

/// Loads snapshots through PostgREST with the caller's token, so row level
/// security applies exactly as it does for the change subscription.
pub struct SupabaseSnapshotLoader {
    supabase: SupabaseClient,
}

impl SupabaseSnapshotLoader {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    pub fn query_for(filter: &SubscriptionFilter) -> RestQuery {
        let query = RestQuery::table(&filter.table).eq(&filter.column, &filter.value);
        match &filter.order_column {
            Some(column) => query.order(column, true),
            None => query,
        }
    }
}

#[async_trait]
impl SnapshotLoader for SupabaseSnapshotLoader {
    async fn load(
        &self,
        filter: &SubscriptionFilter,
        access_token: &str,
    ) -> Result<Vec<Value>, SyncError> {
        let query = Self::query_for(filter);

        let rows = self
            .supabase
            .select(&query, access_token)
            .await
            .map_err(|e| {
                warn!("Snapshot load for {} failed: {}", filter.topic(), e);
                SyncError::Fetch(e.to_string())
            })?;

        debug!("Loaded {} rows for {}", rows.len(), filter.topic());
        Ok(rows)
    }
}
