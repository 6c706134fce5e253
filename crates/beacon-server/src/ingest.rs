//! The ingest path: store, notify, broadcast, and trigger analysis.

use std::sync::Arc;

use beacon_insight::correlate;
use beacon_store::{PendingEvent, StoreError};
use beacon_types::{CapturedEvent, StoredEvent, SubjectId};
use thiserror::Error;
use uuid::Uuid;

use crate::AppState;

/// Why one inbound event was not accepted. Never fatal to the connection.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// Decodes one text frame from connection `from` and ingests it.
pub fn ingest_frame(
    state: &Arc<AppState>,
    subject: &SubjectId,
    from: Uuid,
    frame: &str,
) -> Result<Arc<StoredEvent>, IngestError> {
    let limit = state.limits.max_frame_bytes;
    if frame.len() > limit {
        return Err(IngestError::TooLarge {
            size: frame.len(),
            limit,
        });
    }
    let event: CapturedEvent = serde_json::from_str(frame)?;
    ingest_event(state, subject, Some(from), event)
}

/// Stores `event` and fans it out.
///
/// Errors (`error`, `unhandledRejection`, `console.error`) are classified
/// before storing, then correlated and handed to the analysis sink on a
/// spawned task. The stored event goes to the subject's notifier topic and
/// to every connection on the subject except `from`.
pub fn ingest_event(
    state: &Arc<AppState>,
    subject: &SubjectId,
    from: Option<Uuid>,
    event: CapturedEvent,
) -> Result<Arc<StoredEvent>, IngestError> {
    let classification = event
        .body
        .is_error()
        .then(|| state.classifier.classify(event.body.message(), event.body.stack()));

    let stored = state
        .store
        .append(subject, PendingEvent::new(event, classification))?;

    state.notifier.publish(&stored);

    match serde_json::to_string(&*stored) {
        Ok(frame) => {
            state.registry.broadcast(subject, from, frame);
        }
        Err(e) => {
            tracing::error!(subject = %subject, seq = stored.seq, "failed to serialize stored event: {}", e);
        }
    }

    if stored.is_error() {
        trigger_analysis(state, subject.clone());
    }

    Ok(stored)
}

fn trigger_analysis(state: &Arc<AppState>, subject: SubjectId) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        match correlate(state.store.as_ref(), &subject, &state.correlation) {
            Ok(bundle) => state.analysis.submit(bundle),
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "correlation failed; analysis skipped");
            }
        }
    });
}
