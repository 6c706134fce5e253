//! Background task for enforcing event retention.

use crate::notifier::Notifier;
use beacon_store::EventStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub events_purged: usize,
    pub topics_reclaimed: usize,
}

/// Purges expired events across all subjects and drops notifier topics
/// nobody listens to. A store failure is logged and the sweep continues.
pub fn sweep_once(store: &dyn EventStore, notifier: &Notifier) -> SweepReport {
    let events_purged = match store.purge_expired(Utc::now()) {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, "failed to purge expired events");
            0
        }
    };
    let topics_reclaimed = notifier.reclaim();
    SweepReport {
        events_purged,
        topics_reclaimed,
    }
}

/// Starts a background task that periodically sweeps expired events.
///
/// This task runs indefinitely.
///
/// # Arguments
///
/// * `store` - The event store to sweep.
/// * `notifier` - Notifier whose idle topics are reclaimed.
/// * `interval` - Time to wait between sweeps.
pub async fn start_retention_task(
    store: Arc<dyn EventStore>,
    notifier: Notifier,
    interval: Duration,
) {
    tracing::info!(
        interval_seconds = interval.as_secs(),
        "starting event retention task"
    );

    loop {
        sleep(interval).await;

        let report = sweep_once(store.as_ref(), &notifier);
        if report.events_purged > 0 || report.topics_reclaimed > 0 {
            tracing::info!(
                events = report.events_purged,
                topics = report.topics_reclaimed,
                "retention sweep removed expired data"
            );
        } else {
            tracing::debug!("nothing expired");
        }
    }
}
