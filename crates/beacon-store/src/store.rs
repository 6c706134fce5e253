//! The event store trait and its in-memory implementation.
//!
//! All writes go through [`EventStore::append`], which assigns the subject's
//! next sequence number, inserts the event in `(timestamp, seq)` order,
//! indexes it when it is an error, and applies capacity and TTL eviction.
//!
//! Reads return `Arc<StoredEvent>` snapshots; nothing handed out is ever
//! mutated afterwards.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use beacon_types::{CapturedEvent, ErrorKind, StoredEvent, SubjectId};
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::StoreError;
use crate::log::SubjectLog;

/// An event accepted by the gateway but not yet stored.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: CapturedEvent,
    /// Set by the classifier for error events.
    pub classification: Option<ErrorKind>,
    pub received_at: DateTime<Utc>,
}

impl PendingEvent {
    /// Wraps an event received right now.
    pub fn new(event: CapturedEvent, classification: Option<ErrorKind>) -> Self {
        Self {
            event,
            classification,
            received_at: Utc::now(),
        }
    }
}

/// Retention limits applied to every subject.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Maximum entries kept per subject, in each of the full log and the
    /// error index.
    pub capacity: usize,
    /// Entries received longer ago than this are purged.
    pub ttl: TimeDelta,
    /// Maximum number of subjects tracked at once.
    pub max_subjects: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: TimeDelta::hours(24),
            max_subjects: 10_000,
        }
    }
}

/// Per-subject bounded event retention.
///
/// Implementations must serialise mutations per subject and must never make
/// one subject wait on another. Reads may observe any consistent snapshot.
pub trait EventStore: Send + Sync {
    /// Stores an event and returns the stored record.
    fn append(&self, subject: &SubjectId, pending: PendingEvent)
        -> Result<Arc<StoredEvent>, StoreError>;

    /// The `limit` most recent events of any kind, newest first.
    fn recent_events(
        &self,
        subject: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Arc<StoredEvent>>, StoreError>;

    /// The `limit` most recent error events, newest first.
    fn recent_errors(
        &self,
        subject: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Arc<StoredEvent>>, StoreError>;

    /// Events with a timestamp in `[from, to]`, oldest first.
    fn events_between(
        &self,
        subject: &SubjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Arc<StoredEvent>>, StoreError>;

    /// Purges entries that had expired at `now` across all subjects.
    /// Returns the number of events removed from the full logs.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

type SubjectMap = HashMap<SubjectId, Arc<RwLock<SubjectLog>>>;

/// In-memory [`EventStore`].
///
/// The subject map and each subject's log sit behind separate `std::sync`
/// locks. Every acquisition is a short, non-async critical section, so a
/// synchronous lock is cheaper than `tokio::sync::RwLock` and safe to use
/// from async handlers.
#[derive(Debug)]
pub struct MemoryStore {
    settings: StoreSettings,
    subjects: RwLock<SubjectMap>,
}

impl MemoryStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            settings,
            subjects: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Number of subjects currently holding events.
    pub fn subject_count(&self) -> usize {
        read_lock(&self.subjects).len()
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.settings.ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn with_log<T>(&self, subject: &SubjectId, f: impl FnOnce(&SubjectLog) -> T) -> Option<T> {
        let subjects = read_lock(&self.subjects);
        let log = subjects.get(subject)?;
        let guard = read_lock(log);
        Some(f(&guard))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

impl EventStore for MemoryStore {
    fn append(
        &self,
        subject: &SubjectId,
        pending: PendingEvent,
    ) -> Result<Arc<StoredEvent>, StoreError> {
        let cutoff = self.cutoff(pending.received_at);
        let capacity = self.settings.capacity;

        // Fast path: the subject exists. The map read guard is held while the
        // log is written so a concurrent sweep cannot drop the log mid-append.
        {
            let subjects = read_lock(&self.subjects);
            if let Some(log) = subjects.get(subject) {
                let mut log = write_lock(log);
                log.expire(cutoff);
                return Ok(log.push(subject, pending, capacity));
            }
        }

        let mut subjects = write_lock(&self.subjects);
        if !subjects.contains_key(subject) && subjects.len() >= self.settings.max_subjects {
            tracing::warn!(
                subject = %subject,
                max_subjects = self.settings.max_subjects,
                "refusing event for new subject: subject limit reached"
            );
            return Err(StoreError::SubjectLimit(self.settings.max_subjects));
        }
        let log = subjects
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SubjectLog::new())));
        let mut log = write_lock(log);
        log.expire(cutoff);
        Ok(log.push(subject, pending, capacity))
    }

    fn recent_events(
        &self,
        subject: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Arc<StoredEvent>>, StoreError> {
        let cutoff = self.cutoff(Utc::now());
        Ok(self
            .with_log(subject, |log| log.recent_events(limit, cutoff))
            .unwrap_or_default())
    }

    fn recent_errors(
        &self,
        subject: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Arc<StoredEvent>>, StoreError> {
        let cutoff = self.cutoff(Utc::now());
        Ok(self
            .with_log(subject, |log| log.recent_errors(limit, cutoff))
            .unwrap_or_default())
    }

    fn events_between(
        &self,
        subject: &SubjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Arc<StoredEvent>>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let cutoff = self.cutoff(Utc::now());
        Ok(self
            .with_log(subject, |log| log.between(from, to, cutoff))
            .unwrap_or_default())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = self.cutoff(now);
        let mut subjects = write_lock(&self.subjects);
        let mut removed = 0;
        subjects.retain(|subject, log| {
            let mut guard = write_lock(log);
            let n = guard.expire(cutoff);
            if n > 0 {
                tracing::debug!(subject = %subject, removed = n, "expired events");
            }
            removed += n;
            !guard.is_empty()
        });
        Ok(removed)
    }
}

// A panic while holding a store lock leaves the buffers structurally intact
// (every mutation is a single VecDeque call), so recover the guard instead of
// failing every later request for the subject.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("event store lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("event store lock poisoned, recovering");
        poisoned.into_inner()
    })
}
