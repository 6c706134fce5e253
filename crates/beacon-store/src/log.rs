//! The per-subject ordered log and its error index.

use std::collections::VecDeque;
use std::sync::Arc;

use beacon_types::{StoredEvent, SubjectId};
use chrono::{DateTime, Utc};

use crate::store::PendingEvent;

/// Ordered retention for one subject.
///
/// Both buffers are sorted by [`StoredEvent::order_key`], oldest first. The
/// error index holds clones of the same `Arc`s that were pushed into
/// `events`.
#[derive(Debug)]
pub(crate) struct SubjectLog {
    events: VecDeque<Arc<StoredEvent>>,
    errors: VecDeque<Arc<StoredEvent>>,
    next_seq: u64,
}

impl SubjectLog {
    pub(crate) fn new() -> Self {
        Self {
            events: VecDeque::new(),
            errors: VecDeque::new(),
            next_seq: 1,
        }
    }

    /// Stamps the pending event with the next sequence number and inserts it
    /// in order, then trims both buffers to `capacity`.
    pub(crate) fn push(
        &mut self,
        subject: &SubjectId,
        pending: PendingEvent,
        capacity: usize,
    ) -> Arc<StoredEvent> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let PendingEvent {
            event,
            classification,
            received_at,
        } = pending;

        let stored = Arc::new(StoredEvent {
            subject: subject.clone(),
            seq,
            timestamp: event.timestamp,
            received_at,
            body: event.body,
            classification,
        });

        insert_ordered(&mut self.events, Arc::clone(&stored));
        if stored.is_error() {
            insert_ordered(&mut self.errors, Arc::clone(&stored));
        }

        trim_front(&mut self.events, capacity);
        trim_front(&mut self.errors, capacity);

        stored
    }

    /// Drops every entry received before `cutoff`. Returns how many entries
    /// left the full log.
    pub(crate) fn expire(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.received_at >= cutoff);
        self.errors.retain(|e| e.received_at >= cutoff);
        before - self.events.len()
    }

    /// Newest first, skipping anything received before `cutoff`.
    pub(crate) fn recent_events(&self, limit: usize, cutoff: DateTime<Utc>) -> Vec<Arc<StoredEvent>> {
        newest_first(&self.events, limit, cutoff)
    }

    pub(crate) fn recent_errors(&self, limit: usize, cutoff: DateTime<Utc>) -> Vec<Arc<StoredEvent>> {
        newest_first(&self.errors, limit, cutoff)
    }

    /// Events whose timestamp lies in `[from, to]`, oldest first.
    pub(crate) fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Vec<Arc<StoredEvent>> {
        let start = self.events.partition_point(|e| e.timestamp < from);
        self.events
            .range(start..)
            .take_while(|e| e.timestamp <= to)
            .filter(|e| e.received_at >= cutoff)
            .cloned()
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty() && self.errors.is_empty()
    }
}

fn insert_ordered(buf: &mut VecDeque<Arc<StoredEvent>>, event: Arc<StoredEvent>) {
    let key = event.order_key();
    // Nearly always lands at the back; late arrivals slot in behind newer entries.
    let idx = buf.partition_point(|e| e.order_key() <= key);
    buf.insert(idx, event);
}

fn trim_front(buf: &mut VecDeque<Arc<StoredEvent>>, capacity: usize) {
    while buf.len() > capacity {
        buf.pop_front();
    }
}

fn newest_first(
    buf: &VecDeque<Arc<StoredEvent>>,
    limit: usize,
    cutoff: DateTime<Utc>,
) -> Vec<Arc<StoredEvent>> {
    buf.iter()
        .rev()
        .filter(|e| e.received_at >= cutoff)
        .take(limit)
        .cloned()
        .collect()
}
