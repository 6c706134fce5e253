//! The fixed error taxonomy.

use serde::{Deserialize, Serialize};

/// Classification assigned to error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A property or method was accessed on `null` (or `None` was unwrapped).
    NullDereference,
    /// A property or method was accessed on `undefined`.
    UndefinedReference,
    /// A name that was never declared or imported.
    UnresolvedIdentifier,
    /// Source failed to parse.
    SyntaxError,
    /// The request never got a response.
    NetworkFailure,
    /// The browser blocked a cross-origin response.
    CrossOriginFailure,
    /// HTTP 404 or a missing resource.
    NotFound,
    /// HTTP 5xx.
    ServerError,
    /// Nothing matched.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 9] = [
        Self::NullDereference,
        Self::UndefinedReference,
        Self::UnresolvedIdentifier,
        Self::SyntaxError,
        Self::NetworkFailure,
        Self::CrossOriginFailure,
        Self::NotFound,
        Self::ServerError,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NullDereference => "null-dereference",
            Self::UndefinedReference => "undefined-reference",
            Self::UnresolvedIdentifier => "unresolved-identifier",
            Self::SyntaxError => "syntax-error",
            Self::NetworkFailure => "network-failure",
            Self::CrossOriginFailure => "cross-origin-failure",
            Self::NotFound => "not-found",
            Self::ServerError => "server-error",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds that mark a correlation bundle as critical.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::NullDereference | Self::UndefinedReference | Self::SyntaxError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = ParseErrorKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseErrorKindError(s.to_string()))
    }
}

/// Error returned when parsing an unknown taxonomy label.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown error kind: {0}")]
pub struct ParseErrorKindError(pub String);
