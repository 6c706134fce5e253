//! Error types for the event store.

/// Errors that can occur during event store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A new subject would exceed the configured subject limit.
    #[error("event store is tracking the maximum of {0} subjects")]
    SubjectLimit(usize),

    /// The backing store cannot serve requests right now.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}
