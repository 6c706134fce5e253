use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use beacon_server::ingest::ingest_event;
use beacon_server::policy::TokenPolicy;
use beacon_server::{app, AppState};
use beacon_store::{MemoryStore, StoreSettings};
use beacon_types::{CapturedEvent, ConsoleMethod, EventBody, SubjectId};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt; // for oneshot

fn setup() -> (Router, Arc<AppState>) {
    let policy = TokenPolicy::new(false)
        .grant("reader", ["proj-1"])
        .grant("admin", ["*"]);
    let state = AppState::new(
        Arc::new(MemoryStore::new(StoreSettings::default())),
        Arc::new(policy),
    );
    (app(state.clone()), Arc::new(state))
}

fn at(secs: u32) -> chrono::DateTime<chrono::Utc> {
    format!("2025-01-01T00:00:{secs:02}Z").parse().unwrap()
}

fn console(secs: u32, method: ConsoleMethod, message: &str) -> CapturedEvent {
    CapturedEvent {
        timestamp: at(secs),
        body: EventBody::Console {
            method,
            message: message.to_string(),
            args: Vec::new(),
            source: None,
        },
    }
}

fn error(secs: u32, message: &str) -> CapturedEvent {
    CapturedEvent {
        timestamp: at(secs),
        body: EventBody::Error {
            message: message.to_string(),
            stack: None,
            source: None,
        },
    }
}

fn seed(state: &Arc<AppState>) {
    let subject: SubjectId = "proj-1".parse().unwrap();
    for event in [
        console(1, ConsoleMethod::Log, "booting"),
        console(2, ConsoleMethod::Warn, "slow render"),
        error(3, "TypeError: Cannot read properties of null (reading 'id')"),
        console(4, ConsoleMethod::Info, "retrying"),
        error(20, "GET /api/users failed with status 404"),
    ] {
        ingest_event(state, &subject, None, event).unwrap();
    }
}

async fn get(app: Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    let response = app
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = setup();
    let (status, body) = get(app, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn events_are_returned_newest_first() {
    let (app, state) = setup();
    seed(&state);

    let (status, body) = get(app, "/api/subjects/proj-1/events?limit=3", Some("reader")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "proj-1");

    let messages: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"].as_str().unwrap())
        .collect();
    assert_eq!(
        messages,
        [
            "GET /api/users failed with status 404",
            "retrying",
            "TypeError: Cannot read properties of null (reading 'id')"
        ]
    );
}

#[tokio::test]
async fn errors_carry_their_classification() {
    let (app, state) = setup();
    seed(&state);

    let (status, body) = get(app, "/api/subjects/proj-1/errors", Some("reader")).await;
    assert_eq!(status, StatusCode::OK);

    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0]["classification"], "not-found");
    assert_eq!(errors[1]["classification"], "null-dereference");
}

#[tokio::test]
async fn stats_count_kinds_and_levels() {
    let (app, state) = setup();
    seed(&state);

    let (status, body) = get(app, "/api/subjects/proj-1/stats", Some("admin")).await;
    assert_eq!(status, StatusCode::OK);

    let stats = &body["stats"];
    assert_eq!(stats["sampled"], 5);
    assert_eq!(stats["byKind"]["console"], 3);
    assert_eq!(stats["byKind"]["error"], 2);
    assert_eq!(stats["byLevel"]["warn"], 1);
    assert_eq!(stats["byClassification"]["null-dereference"], 1);
}

#[tokio::test]
async fn correlation_bundle_includes_context_window() {
    let (app, state) = setup();
    seed(&state);

    let (status, body) = get(app, "/api/subjects/proj-1/correlation", Some("reader")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "proj-1");
    assert_eq!(body["hasCritical"], true);

    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 2);

    // The null dereference at 00:03 has its four neighbours within five
    // seconds; the 404 at 00:20 stands alone.
    assert_eq!(errors[0]["kind"], "not-found");
    assert_eq!(errors[0]["context"].as_array().unwrap().len(), 1);
    assert_eq!(errors[1]["kind"], "null-dereference");
    assert_eq!(errors[1]["context"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn unknown_subject_is_empty_not_missing() {
    let (app, _) = setup();
    let (status, body) = get(app, "/api/subjects/fresh/events", Some("admin")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn anonymous_callers_get_401() {
    let (app, _) = setup();
    let (status, body) = get(app, "/api/subjects/proj-1/events", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn tokens_for_other_subjects_get_403() {
    let (app, _) = setup();
    let (status, _) = get(app.clone(), "/api/subjects/proj-2/errors", Some("reader")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = get(app, "/api/subjects/proj-1/errors", Some("unknown")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn query_token_is_accepted() {
    let (app, state) = setup();
    seed(&state);
    let (status, body) = get(app, "/api/subjects/proj-1/errors?token=reader&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_subject_gets_400() {
    let (app, _) = setup();
    let (status, body) = get(app, "/api/subjects/bad%21id/events", Some("admin")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid subject"));
}
