use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::models::{RawChange, SubscriptionFilter};
use crate::SyncError;

/// Live change feed for one filter. Dropping it releases the subscription.
pub type ChangeStream = BoxStream<'static, Result<RawChange, SyncError>>;

/// Push-based subscription to a backend table.
#[async_trait]
pub trait ChangeEventSource: Send + Sync {
    async fn subscribe(
        &self,
        filter: &SubscriptionFilter,
        access_token: &str,
    ) -> Result<ChangeStream, SyncError>;
}

type TopicSender = broadcast::Sender<Result<RawChange, SyncError>>;

/// In-process change source keyed by topic.
///
/// Writers inside the process publish row changes; every subscriber of the
/// same filter receives them. Also lets callers simulate a dropped channel.
pub struct BroadcastEventSource {
    channels: Arc<RwLock<HashMap<String, TopicSender>>>,
    available: Arc<AtomicBool>,
    capacity: usize,
}

impl BroadcastEventSource {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            capacity,
        }
    }

    /// Subscribes to `topic`, creating its channel if needed. Receivers are
    /// attached under the lock so pruning cannot orphan them.
    async fn receiver(&self, topic: &str) -> broadcast::Receiver<Result<RawChange, SyncError>> {
        if let Some(sender) = self.channels.read().await.get(topic) {
            return sender.subscribe();
        }

        let mut channels = self.channels.write().await;
        prune(&mut channels);
        channels
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!("Created change channel for {}", topic);
                broadcast::channel(self.capacity).0
            })
            .subscribe()
    }

    /// Publishes a change to current subscribers. Returns how many received it.
    pub async fn publish(&self, filter: &SubscriptionFilter, change: RawChange) -> usize {
        self.send(filter, Ok(change)).await
    }

    /// Delivers a subscription failure to current subscribers.
    pub async fn disconnect(&self, filter: &SubscriptionFilter, reason: &str) -> usize {
        self.send(filter, Err(SyncError::Subscription(reason.to_string())))
            .await
    }

    async fn send(&self, filter: &SubscriptionFilter, item: Result<RawChange, SyncError>) -> usize {
        let topic = filter.topic();
        {
            let channels = self.channels.read().await;
            match channels.get(&topic) {
                Some(sender) => {
                    if let Ok(received) = sender.send(item) {
                        return received;
                    }
                }
                None => {
                    debug!("No subscribers for {}, change dropped", topic);
                    return 0;
                }
            }
        }

        // Every receiver of the topic is gone.
        let mut channels = self.channels.write().await;
        if channels
            .get(&topic)
            .map(|sender| sender.receiver_count() == 0)
            .unwrap_or(false)
        {
            channels.remove(&topic);
            debug!("Removed change channel for {}", topic);
        }
        0
    }

    /// While unavailable, new subscriptions fail with `SyncError::Subscription`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn subscriber_count(&self, filter: &SubscriptionFilter) -> usize {
        self.channels
            .read()
            .await
            .get(&filter.topic())
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub async fn active_topics(&self) -> Vec<String> {
        let channels = self.channels.read().await;
        channels
            .iter()
            .filter(|(_, sender)| sender.receiver_count() > 0)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Channels currently held, including ones whose subscribers are gone
    /// but have not been pruned yet.
    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

fn prune(channels: &mut HashMap<String, TopicSender>) {
    channels.retain(|topic, sender| {
        let live = sender.receiver_count() > 0;
        if !live {
            debug!("Removed change channel for {}", topic);
        }
        live
    });
}

impl Default for BroadcastEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BroadcastEventSource {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
            available: Arc::clone(&self.available),
            capacity: self.capacity,
        }
    }
}

#[async_trait]
impl ChangeEventSource for BroadcastEventSource {
    async fn subscribe(
        &self,
        filter: &SubscriptionFilter,
        _access_token: &str,
    ) -> Result<ChangeStream, SyncError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::Subscription(format!(
                "change source unavailable for {}",
                filter.topic()
            )));
        }

        let receiver = self.receiver(&filter.topic()).await;

        let changes = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(item) => Some((item, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Change subscriber lagged, {} changes skipped", skipped);
                    Some((
                        Err(SyncError::Subscription(format!("lagged by {} changes", skipped))),
                        receiver,
                    ))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(changes.boxed())
    }
}
