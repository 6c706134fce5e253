//! End-to-end flow: capture agent -> gateway -> store, broadcast, analysis.

use beacon_agent::{AgentConfig, Arg, BackoffPolicy, CaptureAgent, ConnectionState};
use beacon_insight::CorrelationBundle;
use beacon_server::analysis::AnalysisSink;
use beacon_server::policy::TokenPolicy;
use beacon_server::{app, AppState};
use beacon_store::{MemoryStore, StoreSettings};
use beacon_types::SubjectId;
use futures_util::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

struct ChannelSink(mpsc::UnboundedSender<CorrelationBundle>);

impl AnalysisSink for ChannelSink {
    fn submit(&self, bundle: CorrelationBundle) {
        let _ = self.0.send(bundle);
    }
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

fn agent_config(addr: SocketAddr, token: &str) -> AgentConfig {
    let mut config = AgentConfig::new(format!("http://{addr}"), "proj-1".parse().unwrap())
        .with_token(token);
    config.backoff = BackoffPolicy {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(100),
        max_attempts: 3,
    };
    config
}

async fn wait_for_state(agent: &CaptureAgent, wanted: ConnectionState) {
    for _ in 0..500 {
        if agent.state() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent stuck in {} waiting for {}", agent.state(), wanted);
}

#[tokio::test]
async fn test_agent_events_flow_through_gateway() {
    let (bundles_tx, mut bundles_rx) = mpsc::unbounded_channel();
    let state = AppState::new(
        Arc::new(MemoryStore::new(StoreSettings::default())),
        Arc::new(TokenPolicy::new(false).grant("t0k", ["proj-1"])),
    )
    .with_analysis(Arc::new(ChannelSink(bundles_tx)));
    let addr = spawn_server(state.clone()).await;
    let subject: SubjectId = "proj-1".parse().unwrap();

    // A dashboard watching the subject
    let (mut dashboard, _) = connect_async(format!("ws://{addr}/ws/proj-1?token=t0k"))
        .await
        .expect("failed to connect dashboard");
    for _ in 0..100 {
        if state.registry.peer_count(&subject) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Events emitted before the agent connects are flushed in order
    let agent = CaptureAgent::start(agent_config(addr, "t0k")).unwrap();
    let console = agent.console().with_writers(std::io::sink(), std::io::sink());
    console.log(&["booting".into(), Arg::from(3_i64)]);
    console.warn(&["cache miss".into()]);
    console.error(&["render failed:".into(), "Cannot read properties of undefined (reading 'map')".into()]);
    let missing = reqwest::get(format!("http://{addr}/missing")).await;
    agent.observe_response(missing).unwrap();

    wait_for_state(&agent, ConnectionState::Open).await;

    let mut received = Vec::new();
    while received.len() < 4 {
        let msg = timeout(Duration::from_secs(5), dashboard.next())
            .await
            .expect("timed out waiting for broadcast")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            received.push(value);
        }
    }

    assert_eq!(received[0]["message"], "booting 3");
    assert_eq!(received[0]["method"], "log");
    assert_eq!(received[1]["method"], "warn");
    assert_eq!(received[2]["method"], "error");
    assert_eq!(received[2]["classification"], "undefined-reference");
    assert_eq!(received[3]["kind"], "error");
    assert_eq!(received[3]["classification"], "not-found");
    let seqs: Vec<u64> = received.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, [1, 2, 3, 4]);

    // Every stored error triggers a correlation bundle
    let bundle = timeout(Duration::from_secs(5), bundles_rx.recv())
        .await
        .expect("timed out waiting for analysis")
        .expect("sink closed");
    assert_eq!(bundle.subject, subject);
    assert!(!bundle.errors.is_empty());

    agent.teardown().await;
    assert_eq!(agent.state(), ConnectionState::Closed);

    let stored = state.store.recent_events(&subject, 10).unwrap();
    assert_eq!(stored.len(), 4);
}

#[tokio::test]
async fn test_agent_with_rejected_token_stops_retrying() {
    let state = AppState::new(
        Arc::new(MemoryStore::new(StoreSettings::default())),
        Arc::new(TokenPolicy::new(false).grant("t0k", ["proj-1"])),
    );
    let addr = spawn_server(state.clone()).await;

    let agent = CaptureAgent::start(agent_config(addr, "wrong")).unwrap();
    agent.report_rejection("queued before refusal");

    wait_for_state(&agent, ConnectionState::DisconnectedPermanent).await;
    // The refused socket is never read, so nothing reaches the store.
    assert!(state
        .store
        .recent_events(&"proj-1".parse().unwrap(), 10)
        .unwrap()
        .is_empty());

    agent.teardown().await;
}
