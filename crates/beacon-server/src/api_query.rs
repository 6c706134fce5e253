//! Read-only query handlers for dashboards and analysis workers.

use crate::policy::Caller;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use beacon_insight::{aggregate, correlate, CorrelationBundle};
use beacon_store::StoreError;
use beacon_types::{ParseSubjectError, StoredEvent, SubjectId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Default number of entries returned when `limit` is omitted.
const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub limit: Option<usize>,
    pub token: Option<String>,
}

/// Errors surfaced by the query API.
#[derive(Debug)]
pub enum ApiError {
    InvalidSubject(ParseSubjectError),
    Unauthorized,
    Forbidden,
    Unavailable(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidSubject(e) => (StatusCode::BAD_REQUEST, format!("invalid subject: {e}")),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "credentials required".to_string()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "access denied".to_string()),
            Self::Unavailable(e) => {
                tracing::error!(error = %e, "query failed: store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Unavailable(e)
    }
}

/// Parses the subject and checks the caller against the access policy.
pub(crate) fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
    raw_subject: &str,
) -> Result<SubjectId, ApiError> {
    let subject: SubjectId = raw_subject.parse().map_err(ApiError::InvalidSubject)?;
    let caller = Caller::from_request(headers, query_token);
    if state.policy.can_access(&caller, &subject) {
        Ok(subject)
    } else if caller.is_anonymous() {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Forbidden)
    }
}

fn as_refs(events: &[Arc<StoredEvent>]) -> Vec<&StoredEvent> {
    events.iter().map(Arc::as_ref).collect()
}

/// Handler for `GET /api/subjects/{subject}/events`.
///
/// Most recent events of any kind, newest first.
pub async fn get_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let subject = authorize(&state, &headers, params.token.as_deref(), &subject)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    let events = state.store.recent_events(&subject, limit)?;
    Ok(Json(json!({
        "subject": subject,
        "events": as_refs(&events),
    })))
}

/// Handler for `GET /api/subjects/{subject}/errors`.
///
/// Most recent error events, newest first.
pub async fn get_errors_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let subject = authorize(&state, &headers, params.token.as_deref(), &subject)?;
    let limit = params.limit.unwrap_or(state.correlation.recent_errors);
    let errors = state.store.recent_errors(&subject, limit)?;
    Ok(Json(json!({
        "subject": subject,
        "errors": as_refs(&errors),
    })))
}

/// Handler for `GET /api/subjects/{subject}/stats`.
pub async fn get_stats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let subject = authorize(&state, &headers, params.token.as_deref(), &subject)?;
    let sample = state
        .store
        .recent_events(&subject, state.correlation.stats_sample)?;
    Ok(Json(json!({
        "subject": subject,
        "stats": aggregate(&sample),
    })))
}

/// Handler for `GET /api/subjects/{subject}/correlation`.
pub async fn get_correlation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Json<CorrelationBundle>, ApiError> {
    let subject = authorize(&state, &headers, params.token.as_deref(), &subject)?;
    let bundle = correlate(state.store.as_ref(), &subject, &state.correlation)?;
    Ok(Json(bundle))
}
