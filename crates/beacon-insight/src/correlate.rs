//! Time-windowed context extraction around recent errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use beacon_store::{EventStore, StoreError};
use beacon_types::{ErrorKind, StoredEvent, SubjectId};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::classify;

/// Tuning for [`correlate`].
#[derive(Debug, Clone)]
pub struct CorrelationSettings {
    /// How many of the most recent errors to include.
    pub recent_errors: usize,
    /// Half-width of the context window around each error.
    pub window: TimeDelta,
    /// How many of the most recent events feed the aggregate statistics.
    pub stats_sample: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            recent_errors: 10,
            window: TimeDelta::seconds(5),
            stats_sample: 1000,
        }
    }
}

/// One recent error and the events stored around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub error: StoredEvent,
    pub kind: ErrorKind,
    /// Every event (the error included) within the window, oldest first.
    pub context: Vec<StoredEvent>,
}

/// Counts over a sample of recent events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub sampled: usize,
    pub by_kind: BTreeMap<String, usize>,
    /// Console events only, keyed by method.
    pub by_level: BTreeMap<String, usize>,
    /// Error events only, keyed by taxonomy label.
    pub by_classification: BTreeMap<String, usize>,
}

/// Everything the analysis collaborator receives about a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationBundle {
    pub subject: SubjectId,
    pub generated_at: DateTime<Utc>,
    /// Newest first.
    pub errors: Vec<ErrorContext>,
    pub stats: EventStats,
    /// True if any included error is of a critical kind.
    pub has_critical: bool,
    /// Errors left out because their context could not be built.
    pub skipped: usize,
}

impl CorrelationBundle {
    /// The included errors, newest first.
    pub fn recent_errors(&self) -> impl Iterator<Item = &StoredEvent> {
        self.errors.iter().map(|c| &c.error)
    }
}

/// Builds a correlation bundle for `subject`.
///
/// Only the initial error lookup is fatal. A context window that cannot be
/// computed or read skips that one error, and failing statistics leave the
/// stats empty, so callers always get whatever could be gathered.
///
/// # Errors
///
/// Returns the store error if the subject's recent errors cannot be read.
pub fn correlate(
    store: &dyn EventStore,
    subject: &SubjectId,
    settings: &CorrelationSettings,
) -> Result<CorrelationBundle, StoreError> {
    let recent = store.recent_errors(subject, settings.recent_errors)?;

    let mut errors = Vec::with_capacity(recent.len());
    let mut skipped = 0;
    for error in &recent {
        match context_for(store, subject, error, settings.window) {
            Ok(ctx) => errors.push(ctx),
            Err(reason) => {
                tracing::warn!(
                    subject = %subject,
                    seq = error.seq,
                    "skipping error in correlation: {}",
                    reason
                );
                skipped += 1;
            }
        }
    }

    let stats = match store.recent_events(subject, settings.stats_sample) {
        Ok(events) => aggregate(&events),
        Err(e) => {
            tracing::warn!(subject = %subject, error = %e, "correlation stats unavailable");
            EventStats::default()
        }
    };

    let has_critical = errors.iter().any(|c| c.kind.is_critical());

    Ok(CorrelationBundle {
        subject: subject.clone(),
        generated_at: Utc::now(),
        errors,
        stats,
        has_critical,
        skipped,
    })
}

fn context_for(
    store: &dyn EventStore,
    subject: &SubjectId,
    error: &Arc<StoredEvent>,
    window: TimeDelta,
) -> Result<ErrorContext, String> {
    let from = error
        .timestamp
        .checked_sub_signed(window)
        .ok_or("window start out of range")?;
    let to = error
        .timestamp
        .checked_add_signed(window)
        .ok_or("window end out of range")?;
    let context = store
        .events_between(subject, from, to)
        .map_err(|e| e.to_string())?;

    // Entries stored before classification existed get classified here.
    let kind = error
        .classification
        .unwrap_or_else(|| classify(error.body.message(), error.body.stack()));

    Ok(ErrorContext {
        error: StoredEvent::clone(error),
        kind,
        context: context.iter().map(|e| StoredEvent::clone(e)).collect(),
    })
}

/// Counts events by kind, console level, and error classification.
pub fn aggregate(events: &[Arc<StoredEvent>]) -> EventStats {
    let mut stats = EventStats {
        sampled: events.len(),
        ..EventStats::default()
    };
    for event in events {
        *stats
            .by_kind
            .entry(event.kind().as_str().to_string())
            .or_default() += 1;
        if let Some(method) = event.body.method() {
            *stats
                .by_level
                .entry(method.as_str().to_string())
                .or_default() += 1;
        }
        if let Some(kind) = event.classification {
            *stats
                .by_classification
                .entry(kind.as_str().to_string())
                .or_default() += 1;
        }
    }
    stats
}
