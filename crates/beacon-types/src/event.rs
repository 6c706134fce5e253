//! Event body, envelope, and record types for captured console activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::taxonomy::ErrorKind;
use crate::SubjectId;

/// Console output methods intercepted by the capture agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleMethod {
    /// Plain `log` output.
    Log,
    /// Informational output.
    Info,
    /// Warnings.
    Warn,
    /// Error output. Classified and indexed like an `error` event.
    Error,
    /// Debug and trace output.
    Debug,
}

impl ConsoleMethod {
    /// Returns the canonical string label for this method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

impl std::fmt::Display for ConsoleMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConsoleMethod {
    type Err = ParseConsoleMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "debug" => Ok(Self::Debug),
            _ => Err(ParseConsoleMethodError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown console method string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown console method: {0}")]
pub struct ParseConsoleMethodError(pub String);

/// Top-level event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "console")]
    Console,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "unhandledRejection")]
    UnhandledRejection,
}

impl EventKind {
    /// Returns the wire label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Error => "error",
            Self::UnhandledRejection => "unhandledRejection",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the monitored application an event originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Kind-specific event payload.
///
/// Serialised with an internal `kind` tag so the wire form is a single flat
/// JSON object per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventBody {
    /// An intercepted console call.
    #[serde(rename = "console")]
    Console {
        method: ConsoleMethod,
        message: String,
        /// Safely serialised call arguments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceLocation>,
    },

    /// An uncaught error (or a failed outbound network call).
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceLocation>,
    },

    /// A failed asynchronous task nobody observed.
    #[serde(rename = "unhandledRejection")]
    UnhandledRejection {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Console { .. } => EventKind::Console,
            Self::Error { .. } => EventKind::Error,
            Self::UnhandledRejection { .. } => EventKind::UnhandledRejection,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Console { message, .. }
            | Self::Error { message, .. }
            | Self::UnhandledRejection { message, .. } => message,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Console { .. } => None,
            Self::Error { stack, .. } | Self::UnhandledRejection { stack, .. } => stack.as_deref(),
        }
    }

    /// Console method, for console events only.
    pub fn method(&self) -> Option<ConsoleMethod> {
        match self {
            Self::Console { method, .. } => Some(*method),
            _ => None,
        }
    }

    /// Returns `true` for events that go through classification and the
    /// error index: `error`, `unhandledRejection`, and `console.error`.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Error { .. }
                | Self::UnhandledRejection { .. }
                | Self::Console {
                    method: ConsoleMethod::Error,
                    ..
                }
        )
    }
}

/// One event as emitted by the capture agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    /// Client-side emission time.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl CapturedEvent {
    /// Creates an event stamped with the current time.
    pub fn now(body: EventBody) -> Self {
        Self {
            timestamp: Utc::now(),
            body,
        }
    }
}

/// An event after it has been accepted by the gateway and stored.
///
/// Stored events are immutable; the store hands them out behind `Arc` so the
/// error index and the full log share the same allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub subject: SubjectId,
    /// Strictly increasing per subject; breaks timestamp ties.
    pub seq: u64,
    /// Client-side emission time.
    pub timestamp: DateTime<Utc>,
    /// Gateway receive time. Retention is measured from here.
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorKind>,
}

impl StoredEvent {
    /// The total ordering key within a subject.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.seq)
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn is_error(&self) -> bool {
        self.body.is_error()
    }
}
