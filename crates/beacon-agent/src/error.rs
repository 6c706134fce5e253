use thiserror::Error;

/// Errors raised while starting an agent.
///
/// Once running, the agent never surfaces errors to the host: transport
/// failures are retried and eventually reported through
/// [`ConnectionState`](crate::ConnectionState).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
    #[error("endpoint cannot carry a path: {0}")]
    OpaqueEndpoint(String),
    #[error("capture agent must be started inside a tokio runtime")]
    NoRuntime,
}
