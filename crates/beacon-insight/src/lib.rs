//! Error classification and correlation for captured console activity.
//!
//! - [`classify`] maps error text onto the fixed [`ErrorKind`] taxonomy with
//!   an ordered, case-insensitive rule table. First match wins.
//! - [`correlate`] gathers the most recent errors of a subject, the events
//!   surrounding each one, and aggregate counts into a
//!   [`CorrelationBundle`] for downstream analysis.
//!
//! [`ErrorKind`]: beacon_types::ErrorKind

mod classify;
mod correlate;

pub use classify::{classify, Classifier, Rule};
pub use correlate::{
    aggregate, correlate, CorrelationBundle, CorrelationSettings, ErrorContext, EventStats,
};
