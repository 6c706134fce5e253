use beacon_server::policy::TokenPolicy;
use beacon_server::{app, AppState, GatewayLimits};
use beacon_store::{MemoryStore, StoreSettings};
use beacon_types::SubjectId;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_state() -> AppState {
    let policy = TokenPolicy::new(false)
        .grant("t0k", ["proj-1"])
        .grant("other", ["proj-2"]);
    AppState::new(
        Arc::new(MemoryStore::new(StoreSettings::default())),
        Arc::new(policy),
    )
}

async fn spawn_server(state: AppState) -> SocketAddr {
    let app = app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, subject: &str, token: &str) -> Client {
    let url = format!("ws://{}/ws/{}?token={}", addr, subject, token);
    let (ws, _) = connect_async(url).await.expect("failed to connect");
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send frame");
}

fn console_event(message: &str) -> Value {
    json!({
        "timestamp": "2025-01-01T00:00:00Z",
        "kind": "console",
        "method": "log",
        "message": message
    })
}

async fn wait_for_peers(state: &AppState, subject: &str, wanted: usize) {
    let subject: SubjectId = subject.parse().unwrap();
    for _ in 0..100 {
        if state.registry.peer_count(&subject) == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {wanted} peers on {subject}");
}

#[tokio::test]
async fn event_is_broadcast_to_other_connections_but_not_echoed() {
    let state = test_state();
    let addr = spawn_server(state.clone()).await;

    let mut sender = connect(addr, "proj-1", "t0k").await;
    let mut watcher = connect(addr, "proj-1", "t0k").await;
    wait_for_peers(&state, "proj-1", 2).await;

    send_json(&mut sender, console_event("first")).await;
    send_json(&mut sender, console_event("second")).await;

    let first = next_json(&mut watcher).await;
    let second = next_json(&mut watcher).await;
    assert_eq!(first["message"], "first");
    assert_eq!(first["subject"], "proj-1");
    assert_eq!(second["message"], "second");
    assert!(first["seq"].as_u64().unwrap() < second["seq"].as_u64().unwrap());
    assert!(second["receivedAt"].is_string());

    // An echo of "first" would arrive ahead of this reply.
    send_json(&mut watcher, console_event("from watcher")).await;
    let reply = next_json(&mut sender).await;
    assert_eq!(reply["message"], "from watcher");
}

#[tokio::test]
async fn subjects_are_isolated() {
    let state = test_state();
    let addr = spawn_server(state.clone()).await;

    let mut publisher = connect(addr, "proj-1", "t0k").await;
    let mut outsider = connect(addr, "proj-2", "other").await;
    let mut insider = connect(addr, "proj-1", "t0k").await;
    wait_for_peers(&state, "proj-1", 2).await;
    wait_for_peers(&state, "proj-2", 1).await;

    send_json(&mut publisher, console_event("private")).await;
    assert_eq!(next_json(&mut insider).await["message"], "private");

    let leaked = timeout(Duration::from_millis(200), outsider.next()).await;
    assert!(leaked.is_err(), "proj-2 connection received a proj-1 event");
}

#[tokio::test]
async fn error_events_are_classified_before_broadcast() {
    let state = test_state();
    let addr = spawn_server(state.clone()).await;

    let mut sender = connect(addr, "proj-1", "t0k").await;
    let mut watcher = connect(addr, "proj-1", "t0k").await;
    wait_for_peers(&state, "proj-1", 2).await;

    send_json(
        &mut sender,
        json!({
            "timestamp": "2025-01-01T00:00:01Z",
            "kind": "error",
            "message": "TypeError: Cannot read properties of null (reading 'id')",
            "stack": "at render (app.js:10:5)"
        }),
    )
    .await;

    let event = next_json(&mut watcher).await;
    assert_eq!(event["kind"], "error");
    assert_eq!(event["classification"], "null-dereference");

    let stored = state
        .store
        .recent_errors(&"proj-1".parse().unwrap(), 10)
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn malformed_and_oversized_frames_get_error_replies() {
    let state = test_state().with_limits(GatewayLimits {
        peer_buffer: 16,
        max_frame_bytes: 256,
    });
    let addr = spawn_server(state.clone()).await;
    let mut ws = connect(addr, "proj-1", "t0k").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("malformed"));

    send_json(&mut ws, console_event(&"x".repeat(512))).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("exceeds"));

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");

    // The connection survives rejected frames.
    send_json(&mut ws, console_event("still here")).await;
    let subject: SubjectId = "proj-1".parse().unwrap();
    for _ in 0..100 {
        if !state.store.recent_events(&subject, 10).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = state.store.recent_events(&subject, 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body.message(), "still here");
}

#[tokio::test]
async fn denied_callers_are_closed_with_policy_violation() {
    let state = test_state();
    let addr = spawn_server(state.clone()).await;

    for url in [
        format!("ws://{}/ws/proj-1", addr),
        format!("ws://{}/ws/proj-1?token=other", addr),
    ] {
        let (mut ws, _) = connect_async(url).await.expect("upgrade should succeed");
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
            other => panic!("expected policy close, got {other:?}"),
        }
    }
    assert_eq!(state.registry.subject_count(), 0);
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let state = test_state();
    let addr = spawn_server(state.clone()).await;

    let mut request = format!("ws://{}/ws/proj-1", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("authorization", "Bearer t0k".parse().unwrap());
    let (_ws, _) = connect_async(request).await.expect("failed to connect");

    wait_for_peers(&state, "proj-1", 1).await;
}

#[tokio::test]
async fn invalid_subject_is_rejected_before_upgrade() {
    let state = test_state();
    let addr = spawn_server(state).await;

    let result = connect_async(format!("ws://{}/ws/bad%20subject?token=t0k", addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn closing_the_last_connection_reclaims_the_subject() {
    let state = test_state();
    let addr = spawn_server(state.clone()).await;

    let mut ws = connect(addr, "proj-1", "t0k").await;
    send_json(&mut ws, console_event("kept")).await;
    wait_for_peers(&state, "proj-1", 1).await;

    ws.close(None).await.unwrap();
    wait_for_peers(&state, "proj-1", 0).await;
    assert_eq!(state.registry.subject_count(), 0);

    // Stored events outlive the connection.
    let events = state
        .store
        .recent_events(&"proj-1".parse().unwrap(), 10)
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn messages_past_the_socket_cap_end_the_connection() {
    let limits = GatewayLimits {
        peer_buffer: 16,
        max_frame_bytes: 256,
    };
    let state = test_state().with_limits(limits);
    let addr = spawn_server(state.clone()).await;
    let mut ws = connect(addr, "proj-1", "t0k").await;
    wait_for_peers(&state, "proj-1", 1).await;

    let huge = "x".repeat(limits.socket_message_bytes() * 8);
    send_json(&mut ws, console_event(&huge)).await;
    let ended = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "oversized message should end the connection");
    wait_for_peers(&state, "proj-1", 0).await;

    // Other connections are unaffected.
    let mut ws = connect(addr, "proj-1", "t0k").await;
    send_json(&mut ws, console_event("after")).await;
    let subject: SubjectId = "proj-1".parse().unwrap();
    for _ in 0..100 {
        if !state.store.recent_events(&subject, 10).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = state.store.recent_events(&subject, 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body.message(), "after");
}
