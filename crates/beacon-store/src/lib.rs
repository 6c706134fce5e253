//! Bounded, time-limited event retention for the Beacon relay.
//!
//! Every subject owns an ordered log of [`StoredEvent`]s plus a secondary
//! index holding only error events. Both are bounded to the `capacity` most
//! recent entries and purged once entries outlive the retention window.
//!
//! # Ordering
//!
//! Entries are ordered by `(timestamp, seq)`. The sequence number is
//! assigned on append and is strictly increasing per subject, so events that
//! share a millisecond still have a total order.
//!
//! # Concurrency
//!
//! | Operation | Lock taken |
//! |-----------|-----------|
//! | append to an existing subject | map read + subject write |
//! | first append for a subject | map write |
//! | reads | map read + subject read |
//! | retention sweep | map write |
//!
//! Writes to one subject never wait on writes to another.
//!
//! # Usage
//!
//! ```rust,ignore
//! use beacon_store::{EventStore, MemoryStore, PendingEvent, StoreSettings};
//!
//! let store = MemoryStore::new(StoreSettings::default());
//! let stored = store.append(&subject, PendingEvent::new(event, None))?;
//! let latest = store.recent_events(&subject, 50)?;
//! ```
//!
//! [`StoredEvent`]: beacon_types::StoredEvent

mod error;
mod log;
mod store;

pub use error::StoreError;
pub use store::{EventStore, MemoryStore, PendingEvent, StoreSettings};
