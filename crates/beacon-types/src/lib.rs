//! Shared types for the Beacon console relay.
//!
//! This crate provides the foundational types used across all Beacon crates:
//! the subject identifier that scopes events and connections, the tagged
//! event body that travels over the wire, the stored event envelope, and the
//! fixed error taxonomy produced by the classifier.
//!
//! No crate in the workspace depends on anything *except* `beacon-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

mod event;
mod taxonomy;

pub use event::{
    CapturedEvent, ConsoleMethod, EventBody, EventKind, ParseConsoleMethodError, SourceLocation,
    StoredEvent,
};
pub use taxonomy::{ErrorKind, ParseErrorKindError};

use serde::{Deserialize, Serialize};

/// Maximum length of a subject identifier.
pub const MAX_SUBJECT_LEN: usize = 128;

/// Logical scope to which events, connections, and storage are bound.
///
/// Subject ids are embedded in URLs and topic names, so they are limited to
/// ASCII alphanumerics plus `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    /// Returns the subject id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the notifier topic name for this subject.
    ///
    /// The mapping is deterministic so asynchronous consumers can derive the
    /// topic without asking the gateway.
    pub fn topic(&self) -> String {
        format!("beacon.events.{}", self.0)
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SubjectId {
    type Err = ParseSubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseSubjectError::Empty);
        }
        if s.len() > MAX_SUBJECT_LEN {
            return Err(ParseSubjectError::TooLong(s.len()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(ParseSubjectError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SubjectId {
    type Error = ParseSubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubjectId> for String {
    fn from(value: SubjectId) -> Self {
        value.0
    }
}

/// Error returned when a string is not a valid subject id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseSubjectError {
    #[error("subject id must not be empty")]
    Empty,
    #[error("subject id is {0} bytes, maximum is {MAX_SUBJECT_LEN}")]
    TooLong(usize),
    #[error("subject id contains invalid character {0:?}")]
    InvalidChar(char),
}
