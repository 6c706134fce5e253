//! Subject-scoped publish topics for asynchronous consumers.
//!
//! Publishing never blocks and never fails the caller. A topic exists only
//! while someone subscribes to it; events published to a subject nobody
//! listens to are simply not delivered.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use beacon_types::{StoredEvent, SubjectId};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Notifier {
    capacity: usize,
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Arc<StoredEvent>>>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier {
    /// `capacity` is the per-topic buffer; subscribers further behind than
    /// that skip ahead.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publishes on the event's subject topic. Returns how many subscribers
    /// received it.
    pub fn publish(&self, event: &Arc<StoredEvent>) -> usize {
        let topic = event.subject.topic();
        let topics = self.topics.read().unwrap_or_else(|poisoned| {
            tracing::error!("notifier topics RwLock poisoned; recovering");
            poisoned.into_inner()
        });
        let Some(sender) = topics.get(&topic) else {
            return 0;
        };
        match sender.send(Arc::clone(event)) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!(topic = %topic, seq = event.seq, "notifier topic has no receivers");
                0
            }
        }
    }

    /// Subscribes to `subject`'s topic, creating it if needed.
    pub fn subscribe(&self, subject: &SubjectId) -> broadcast::Receiver<Arc<StoredEvent>> {
        let mut topics = self.topics.write().unwrap_or_else(|poisoned| {
            tracing::error!("notifier topics RwLock poisoned; recovering");
            poisoned.into_inner()
        });
        topics
            .entry(subject.topic())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops topics with no remaining subscribers. Returns how many were
    /// dropped.
    pub fn reclaim(&self) -> usize {
        let mut topics = self.topics.write().unwrap_or_else(|poisoned| {
            tracing::error!("notifier topics RwLock poisoned; recovering");
            poisoned.into_inner()
        });
        let before = topics.len();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        before - topics.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|t| t.len()).unwrap_or_else(|p| p.into_inner().len())
    }
}
