use std::time::Duration;

use beacon_types::SubjectId;
use url::Url;

use crate::error::AgentError;

/// Reconnection delays: `initial` doubled per consecutive failure, capped
/// at `max`. After `max_attempts` consecutive failures the agent stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry following the `failure`-th consecutive
    /// failure (zero-based).
    pub fn delay(&self, failure: u32) -> Duration {
        let factor = 2u32.checked_pow(failure).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Whether `failures` consecutive failures exhaust the policy.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gateway base URL, e.g. `ws://127.0.0.1:3000`. `http`/`https` are
    /// mapped to `ws`/`wss`.
    pub endpoint: String,
    pub subject: SubjectId,
    /// Presented as the `token` query parameter.
    pub token: Option<String>,
    /// Events held while disconnected. The oldest is dropped on overflow.
    pub queue_capacity: usize,
    pub backoff: BackoffPolicy,
    /// Skip the previous panic hook's output once the panic frame has been
    /// written to an open connection.
    pub suppress_forwarded_panics: bool,
}

impl AgentConfig {
    pub fn new(endpoint: impl Into<String>, subject: SubjectId) -> Self {
        Self {
            endpoint: endpoint.into(),
            subject,
            token: None,
            queue_capacity: 100,
            backoff: BackoffPolicy::default(),
            suppress_forwarded_panics: true,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The gateway channel URL: `{endpoint}/ws/{subject}?token=...`.
    pub fn channel_url(&self) -> Result<Url, AgentError> {
        let mut url = Url::parse(&self.endpoint)?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(AgentError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|()| AgentError::UnsupportedScheme(url.scheme().to_string()))?;
        url.path_segments_mut()
            .map_err(|()| AgentError::OpaqueEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .push("ws")
            .push(self.subject.as_str());
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}
