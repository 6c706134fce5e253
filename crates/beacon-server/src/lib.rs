//! Beacon server library logic.

pub mod analysis;
pub mod api_query;
pub mod api_sse;
pub mod api_ws;
pub mod config;
pub mod ingest;
pub mod notifier;
pub mod policy;
pub mod retention;

use analysis::{AnalysisSink, LogAnalysisSink, WebhookAnalysisSink};
use api_ws::ConnectionRegistry;
use axum::{extract::DefaultBodyLimit, routing::get, Extension, Json, Router};
use beacon_insight::{Classifier, CorrelationSettings};
use beacon_store::{EventStore, MemoryStore, StoreSettings};
use chrono::TimeDelta;
use config::Config;
use notifier::Notifier;
use policy::{AccessPolicy, TokenPolicy};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Maximum request body size (64 KiB). The query API takes no bodies.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Per-connection gateway limits.
#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    /// Outbound frames queued per connection.
    pub peer_buffer: usize,
    /// Largest inbound frame accepted, in bytes. Larger frames get an error
    /// reply and the connection stays open.
    pub max_frame_bytes: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            peer_buffer: 256,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl GatewayLimits {
    /// Largest message the websocket layer buffers at all. Anything bigger
    /// ends the connection without being read.
    pub fn socket_message_bytes(&self) -> usize {
        self.max_frame_bytes.saturating_mul(4)
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Event retention.
    pub store: Arc<dyn EventStore>,
    /// Live gateway connections per subject.
    pub registry: ConnectionRegistry,
    /// Subject topics for asynchronous consumers.
    pub notifier: Notifier,
    /// Subject access decisions for the gateway and the query API.
    pub policy: Arc<dyn AccessPolicy>,
    /// Receives a correlation bundle after every stored error.
    pub analysis: Arc<dyn AnalysisSink>,
    /// Error classification rules.
    pub classifier: Classifier,
    /// Correlation tuning.
    pub correlation: CorrelationSettings,
    /// Gateway connection limits.
    pub limits: GatewayLimits,
}

impl AppState {
    /// State with default limits, the built-in classifier, and a logging
    /// analysis sink.
    pub fn new(store: Arc<dyn EventStore>, policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(),
            notifier: Notifier::default(),
            policy,
            analysis: Arc::new(LogAnalysisSink),
            classifier: Classifier::builtin().clone(),
            correlation: CorrelationSettings::default(),
            limits: GatewayLimits::default(),
        }
    }

    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisSink>) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationSettings) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_limits(mut self, limits: GatewayLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builds the full server state from configuration.
    pub fn from_config(config: &Config) -> Self {
        let store = MemoryStore::new(StoreSettings {
            capacity: config.store.capacity,
            ttl: seconds(config.store.ttl_secs),
            max_subjects: config.store.max_subjects,
        });
        let analysis: Arc<dyn AnalysisSink> = match &config.analysis.webhook_url {
            Some(url) => Arc::new(WebhookAnalysisSink::new(url.clone())),
            None => Arc::new(LogAnalysisSink),
        };

        let mut state = Self::new(Arc::new(store), Arc::new(TokenPolicy::from_config(&config.auth)))
            .with_analysis(analysis)
            .with_correlation(CorrelationSettings {
                recent_errors: config.correlation.recent_errors,
                window: seconds(config.correlation.window_secs),
                stats_sample: config.correlation.stats_sample,
            })
            .with_limits(GatewayLimits {
                peer_buffer: config.gateway.peer_buffer,
                max_frame_bytes: config.gateway.max_frame_bytes,
            });
        state.notifier = Notifier::new(config.gateway.notifier_capacity);
        state
    }
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/subjects/{subject}/events",
            get(api_query::get_events_handler),
        )
        .route(
            "/api/subjects/{subject}/errors",
            get(api_query::get_errors_handler),
        )
        .route(
            "/api/subjects/{subject}/stats",
            get(api_query::get_stats_handler),
        )
        .route(
            "/api/subjects/{subject}/correlation",
            get(api_query::get_correlation_handler),
        )
        .route(
            "/api/subjects/{subject}/stream",
            get(api_sse::get_subject_stream_handler),
        )
        .route("/ws/{subject}", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
