//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Event store bounds.
    #[serde(default)]
    pub store: StoreConfig,

    /// Correlation tuning.
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Gateway connection limits.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Access tokens.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Analysis trigger.
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "beacon_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Event store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Events retained per subject.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Retention window in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Distinct subjects the store will track.
    #[serde(default = "default_max_subjects")]
    pub max_subjects: usize,

    /// Seconds between retention sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_recent_errors")]
    pub recent_errors: usize,

    /// Half-width of the context window, in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_stats_sample")]
    pub stats_sample: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Outbound frames buffered per connection before a slow peer starts
    /// missing broadcasts.
    #[serde(default = "default_peer_buffer")]
    pub peer_buffer: usize,

    /// Largest inbound frame accepted, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Notifier topic buffer per subject.
    #[serde(default = "default_notifier_capacity")]
    pub notifier_capacity: usize,
}

/// One access token and the subjects it unlocks. `"*"` grants every
/// subject.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    #[serde(default)]
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Let callers without a token reach every subject.
    #[serde(default)]
    pub allow_anonymous: bool,

    #[serde(default)]
    pub tokens: Vec<TokenGrant>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisConfig {
    /// Correlation bundles are POSTed here when set; otherwise they are
    /// logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capacity() -> usize {
    1000
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_subjects() -> usize {
    10_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_recent_errors() -> usize {
    10
}

fn default_window_secs() -> u64 {
    5
}

fn default_stats_sample() -> usize {
    1000
}

fn default_peer_buffer() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_notifier_capacity() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl_secs(),
            max_subjects: default_max_subjects(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            recent_errors: default_recent_errors(),
            window_secs: default_window_secs(),
            stats_sample: default_stats_sample(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            peer_buffer: default_peer_buffer(),
            max_frame_bytes: default_max_frame_bytes(),
            notifier_capacity: default_notifier_capacity(),
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `BEACON_HOST` overrides `server.host`
/// - `BEACON_PORT` overrides `server.port`
/// - `BEACON_LOG_LEVEL` overrides `logging.level`
/// - `BEACON_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `BEACON_STORE_CAPACITY` overrides `store.capacity`
/// - `BEACON_STORE_TTL_SECS` overrides `store.ttl_secs`
/// - `BEACON_ANALYSIS_WEBHOOK` overrides `analysis.webhook_url`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("BEACON_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("BEACON_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("BEACON_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("BEACON_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(capacity) = std::env::var("BEACON_STORE_CAPACITY") {
        if let Ok(parsed) = capacity.parse() {
            config.store.capacity = parsed;
        }
    }
    if let Ok(ttl) = std::env::var("BEACON_STORE_TTL_SECS") {
        if let Ok(parsed) = ttl.parse() {
            config.store.ttl_secs = parsed;
        }
    }
    if let Ok(url) = std::env::var("BEACON_ANALYSIS_WEBHOOK") {
        config.analysis.webhook_url = (!url.trim().is_empty()).then_some(url);
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.store.capacity == 0 {
        return Err(ConfigError::Invalid {
            field: "store.capacity",
            reason: "must be at least 1".into(),
        });
    }
    if config.store.ttl_secs == 0 {
        return Err(ConfigError::Invalid {
            field: "store.ttl_secs",
            reason: "must be at least 1".into(),
        });
    }
    if config.gateway.peer_buffer == 0 || config.gateway.notifier_capacity == 0 {
        return Err(ConfigError::Invalid {
            field: "gateway",
            reason: "buffers must hold at least one frame".into(),
        });
    }
    if let Some(url) = &config.analysis.webhook_url {
        url::Url::parse(url).map_err(|e| ConfigError::Invalid {
            field: "analysis.webhook_url",
            reason: e.to_string(),
        })?;
    }
    for grant in &config.auth.tokens {
        if grant.token.is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.tokens",
                reason: "token must not be empty".into(),
            });
        }
        for subject in grant.subjects.iter().filter(|s| s.as_str() != "*") {
            subject
                .parse::<beacon_types::SubjectId>()
                .map_err(|e| ConfigError::Invalid {
                    field: "auth.tokens.subjects",
                    reason: format!("{subject}: {e}"),
                })?;
        }
    }
    Ok(())
}
