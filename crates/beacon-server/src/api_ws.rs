//! WebSocket gateway handler and connection registry.

use crate::ingest::ingest_frame;
use crate::policy::Caller;
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Path, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use beacon_types::SubjectId;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Query parameters for the gateway upgrade.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

/// Frames the gateway itself originates. Broadcast events are sent as the
/// bare stored-event JSON.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "error")]
    Error { message: String },
}

/// Connection id -> outbound frame queue.
type PeerMap = HashMap<Uuid, mpsc::Sender<String>>;

/// Live connections, grouped by subject.
///
/// Uses `std::sync::RwLock`: every critical section is a map operation that
/// never spans an `.await`. Lock order is the subject map, then one
/// subject's peer map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    subjects: Arc<RwLock<HashMap<SubjectId, Arc<RwLock<PeerMap>>>>>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose queue was full. They stay connected but miss this frame.
    pub lagging: usize,
    /// Peers whose connection had gone away; they were removed.
    pub removed: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection on `subject`. Returns its id.
    pub fn join(&self, subject: &SubjectId, sender: mpsc::Sender<String>) -> Uuid {
        let connection_id = Uuid::new_v4();
        {
            let subjects = read(&self.subjects);
            if let Some(peers) = subjects.get(subject) {
                write(peers).insert(connection_id, sender);
                return connection_id;
            }
        }
        let mut subjects = write(&self.subjects);
        let peers = subjects.entry(subject.clone()).or_default();
        write(peers).insert(connection_id, sender);
        connection_id
    }

    /// Removes a connection. The subject's entry is reclaimed once its last
    /// connection leaves; stored events are unaffected.
    ///
    /// Only reclaiming an emptied subject takes the map write lock.
    pub fn leave(&self, subject: &SubjectId, connection_id: Uuid) {
        let now_empty = match read(&self.subjects).get(subject) {
            Some(peers) => {
                let mut peers = write(peers);
                peers.remove(&connection_id);
                peers.is_empty()
            }
            None => return,
        };
        if !now_empty {
            return;
        }
        let mut subjects = write(&self.subjects);
        // A join may have landed between the two locks.
        let still_empty = subjects
            .get(subject)
            .is_some_and(|peers| read(peers).is_empty());
        if still_empty {
            subjects.remove(subject);
            tracing::debug!(subject = %subject, "last connection left; subject reclaimed");
        }
    }

    /// Queues `frame` for every connection on `subject` except `exclude`.
    ///
    /// Sends never wait: each peer has its own bounded queue and writer task.
    /// A full queue drops the frame for that peer only; a closed queue
    /// removes that peer only.
    pub fn broadcast(
        &self,
        subject: &SubjectId,
        exclude: Option<Uuid>,
        frame: String,
    ) -> BroadcastReport {
        let peers = match read(&self.subjects).get(subject) {
            Some(peers) => Arc::clone(peers),
            None => return BroadcastReport::default(),
        };
        let targets: Vec<(Uuid, mpsc::Sender<String>)> = read(&peers)
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();
        for (connection_id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.lagging += 1;
                    tracing::warn!(
                        subject = %subject,
                        connection_id = %connection_id,
                        "dropping broadcast frame for slow consumer"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(connection_id),
            }
        }

        for connection_id in closed {
            tracing::debug!(subject = %subject, connection_id = %connection_id, "removing dead peer");
            self.leave(subject, connection_id);
            report.removed += 1;
        }
        report
    }

    pub fn peer_count(&self, subject: &SubjectId) -> usize {
        read(&self.subjects)
            .get(subject)
            .map_or(0, |peers| read(peers).len())
    }

    pub fn subject_count(&self) -> usize {
        read(&self.subjects).len()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("connection registry RwLock poisoned; recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("connection registry RwLock poisoned; recovering");
        poisoned.into_inner()
    })
}

/// Handler for `GET /ws/{subject}`.
///
/// Callers the access policy refuses are still upgraded, then closed with
/// 1008 (policy violation) so websocket clients can tell a refusal from a
/// network failure.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(subject): Path<String>,
    Query(params): Query<WsConnectParams>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    let subject: SubjectId = match subject.parse() {
        Ok(subject) => subject,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid subject: {e}") })),
            )
                .into_response();
        }
    };

    let caller = Caller::from_request(&headers, params.token.as_deref());
    if !state.policy.can_access(&caller, &subject) {
        tracing::warn!(
            subject = %subject,
            remote_addr = %addr,
            anonymous = caller.is_anonymous(),
            "gateway access denied"
        );
        return ws.on_upgrade(reject_socket);
    }

    let cap = state.limits.socket_message_bytes();
    ws.max_message_size(cap)
        .max_frame_size(cap)
        .on_upgrade(move |socket| handle_socket(socket, state, subject, addr))
}

async fn reject_socket(mut socket: WebSocket) {
    let close = AxumMessage::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: "access denied".into(),
    }));
    if let Err(e) = socket.send(close).await {
        tracing::debug!("failed to send policy close frame: {}", e);
    }
}

/// Sends a JSON-serialized error message over the WebSocket sender channel.
fn send_ws_error(tx: &mpsc::Sender<String>, message: String) {
    match serde_json::to_string(&OutgoingMessage::Error { message }) {
        Ok(json) => {
            if let Err(e) = tx.try_send(json) {
                tracing::warn!("failed to send WebSocket error to client: {}", e);
            }
        }
        Err(e) => {
            tracing::error!("failed to serialize WebSocket error message: {}", e);
        }
    }
}

/// Handles one gateway connection until either side closes it.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    subject: SubjectId,
    addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded per-connection queue: a slow reader loses frames instead of
    // growing memory or stalling broadcasts.
    let (tx, mut rx) = mpsc::channel::<String>(state.limits.peer_buffer);
    let connection_id = state.registry.join(&subject, tx.clone());
    tracing::info!(
        subject = %subject,
        connection_id = %connection_id,
        remote_addr = %addr,
        "gateway connection opened"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Frames are ingested one at a time, so a connection's events are
    // stored and broadcast in the order they were sent.
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(AxumMessage::Text(text))) => {
                    if let Err(e) = ingest_frame(&state, &subject, connection_id, text.as_str()) {
                        tracing::warn!(
                            subject = %subject,
                            connection_id = %connection_id,
                            "rejected inbound event: {}",
                            e
                        );
                        send_ws_error(&tx, e.to_string());
                    }
                }
                Some(Ok(AxumMessage::Binary(_))) => {
                    send_ws_error(&tx, "binary frames are not supported".to_string());
                }
                Some(Ok(AxumMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, "websocket receive error: {}", e);
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    state.registry.leave(&subject, connection_id);
    send_task.abort();
    tracing::info!(
        subject = %subject,
        connection_id = %connection_id,
        "gateway connection closed"
    );
}
