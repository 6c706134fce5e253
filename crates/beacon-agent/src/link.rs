//! Connection to the gateway.
//!
//! [`Link`] is the synchronous half: it decides, under one mutex, whether an
//! event goes straight to the writer channel or into the outbox. [`run`] is
//! the asynchronous half that owns the socket, reconnects with backoff, and
//! hands the outbox over in order whenever a connection opens.

use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use beacon_types::{CapturedEvent, ConsoleMethod, EventBody};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use crate::config::BackoffPolicy;
use crate::outbox::Outbox;

/// Agent connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Retries exhausted or the gateway refused the credentials. Only
    /// [`CaptureAgent::reset`](crate::CaptureAgent::reset) leaves this state.
    DisconnectedPermanent,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::DisconnectedPermanent => "disconnected-permanent",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the open connection.
    Sent,
    /// Held in the outbox until the next connection.
    Queued,
    /// The agent was torn down.
    Discarded,
}

/// An event on the writer channel. `written` is signalled once the frame
/// has been flushed to the socket.
pub(crate) struct Outgoing {
    pub(crate) event: CapturedEvent,
    written: Option<std_mpsc::SyncSender<()>>,
}

impl Outgoing {
    fn confirm(self) {
        if let Some(written) = self.written {
            let _ = written.try_send(());
        }
    }
}

impl From<CapturedEvent> for Outgoing {
    fn from(event: CapturedEvent) -> Self {
        Self {
            event,
            written: None,
        }
    }
}

pub(crate) struct Link {
    state: ConnectionState,
    outbox: Outbox<CapturedEvent>,
    tx: Option<mpsc::UnboundedSender<Outgoing>>,
    detached: bool,
}

impl Link {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Connecting,
            outbox: Outbox::new(queue_capacity),
            tx: None,
            detached: false,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
    }

    pub(crate) fn deliver(&mut self, event: CapturedEvent) -> Delivery {
        self.dispatch(event.into())
    }

    /// Like [`deliver`](Self::deliver), but when the event goes to the open
    /// connection also returns a receiver that fires once its frame is
    /// written. Queued or discarded events return `None`.
    pub(crate) fn deliver_confirmed(
        &mut self,
        event: CapturedEvent,
    ) -> Option<std_mpsc::Receiver<()>> {
        let (written, confirmation) = std_mpsc::sync_channel(1);
        let outgoing = Outgoing {
            event,
            written: Some(written),
        };
        (self.dispatch(outgoing) == Delivery::Sent).then_some(confirmation)
    }

    fn dispatch(&mut self, outgoing: Outgoing) -> Delivery {
        if self.detached {
            return Delivery::Discarded;
        }
        let mut outgoing = outgoing;
        if self.state == ConnectionState::Open {
            if let Some(tx) = &self.tx {
                match tx.send(outgoing) {
                    Ok(()) => return Delivery::Sent,
                    Err(mpsc::error::SendError(returned)) => {
                        self.tx = None;
                        outgoing = returned;
                    }
                }
            }
        }
        self.outbox.push(outgoing.event);
        Delivery::Queued
    }

    /// Marks the link open and moves the backlog onto `tx`: a drop marker
    /// first if anything overflowed, then the queued events oldest first.
    pub(crate) fn open(&mut self, tx: mpsc::UnboundedSender<Outgoing>) {
        let (queued, dropped) = self.outbox.drain();
        let marker = (dropped > 0).then(|| {
            let at = queued.first().map(|e| e.timestamp);
            drop_marker(dropped, at)
        });
        for event in marker.into_iter().chain(queued) {
            if let Err(mpsc::error::SendError(returned)) = tx.send(event.into()) {
                self.outbox.push(returned.event);
            }
        }
        self.tx = Some(tx);
        self.state = ConnectionState::Open;
    }

    /// Detaches the writer channel and moves everything not yet written back
    /// into the outbox, `unsent` first. Pending write confirmations are
    /// dropped unsignalled.
    pub(crate) fn close(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Outgoing>,
        unsent: Option<CapturedEvent>,
        next: ConnectionState,
    ) {
        self.tx = None;
        self.state = next;
        if let Some(event) = unsent {
            self.outbox.push(event);
        }
        while let Ok(outgoing) = rx.try_recv() {
            self.outbox.push(outgoing.event);
        }
    }
}

/// The synthetic warning that stands in for overflowed events. It carries
/// the timestamp of the oldest surviving event so it sorts ahead of them.
pub(crate) fn drop_marker(
    dropped: u64,
    at: Option<chrono::DateTime<chrono::Utc>>,
) -> CapturedEvent {
    let body = EventBody::Console {
        method: ConsoleMethod::Warn,
        message: format!("[beacon] {dropped} messages dropped while disconnected"),
        args: vec![],
        source: None,
    };
    match at {
        Some(timestamp) => CapturedEvent { timestamp, body },
        None => CapturedEvent::now(body),
    }
}

/// State shared by the agent handle and its connection task.
pub(crate) struct Transport {
    pub(crate) url: Url,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) link: Mutex<Link>,
    pub(crate) reset: Notify,
}

impl Transport {
    pub(crate) fn new(url: Url, backoff: BackoffPolicy, queue_capacity: usize) -> Self {
        Self {
            url,
            backoff,
            link: Mutex::new(Link::new(queue_capacity)),
            reset: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().set_state(state);
    }
}

enum SessionEnd {
    Shutdown,
    /// The gateway refused the caller. Not retried.
    Rejected(String),
    Dropped(String),
}

/// Connection task. Returns once shutdown is signalled or the agent handle
/// is dropped.
pub(crate) async fn run(transport: Arc<Transport>, mut shutdown: watch::Receiver<bool>) {
    let mut failures: u32 = 0;
    loop {
        transport.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = shutdown.changed() => {
                transport.set_state(ConnectionState::Closed);
                return;
            }
            res = tokio_tungstenite::connect_async(transport.url.as_str()) => res,
        };

        let end = match connected {
            Ok((ws, _response)) => {
                failures = 0;
                tracing::info!(url = %redacted(&transport.url), "capture agent connected");
                session(&transport, ws, &mut shutdown).await
            }
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                SessionEnd::Rejected(format!("handshake refused with {}", response.status()))
            }
            Err(e) => SessionEnd::Dropped(e.to_string()),
        };

        let permanent = match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Rejected(reason) => {
                tracing::warn!(%reason, "gateway rejected capture agent; not retrying");
                true
            }
            SessionEnd::Dropped(reason) => {
                failures += 1;
                tracing::debug!(%reason, failures, "capture agent disconnected");
                transport.backoff.exhausted(failures)
            }
        };

        if permanent {
            if failures > 0 {
                tracing::warn!(failures, "capture agent giving up after repeated failures");
            }
            transport.set_state(ConnectionState::DisconnectedPermanent);
            tokio::select! {
                _ = shutdown.changed() => {
                    transport.set_state(ConnectionState::Closed);
                    return;
                }
                _ = transport.reset.notified() => {
                    failures = 0;
                    continue;
                }
            }
        }

        transport.set_state(ConnectionState::Closed);
        let delay = transport.backoff.delay(failures.saturating_sub(1));
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session<S>(
    transport: &Transport,
    ws: S,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: Sink<Message, Error = tungstenite::Error>
        + futures_util::Stream<Item = Result<Message, tungstenite::Error>>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.lock().open(tx);

    let mut unsent = None;
    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                transport.set_state(ConnectionState::Closing);
                while let Ok(outgoing) = rx.try_recv() {
                    if send_event(&mut sink, &outgoing.event).await.is_err() {
                        break;
                    }
                    outgoing.confirm();
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "agent teardown".into(),
                    })))
                    .await;
                transport.lock().close(&mut rx, None, ConnectionState::Closed);
                return SessionEnd::Shutdown;
            }
            Some(outgoing) = rx.recv() => {
                if let Err(e) = send_event(&mut sink, &outgoing.event).await {
                    unsent = Some(outgoing.event);
                    break SessionEnd::Dropped(e.to_string());
                }
                outgoing.confirm();
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(Some(close)))) if close.code == CloseCode::Policy => {
                    break SessionEnd::Rejected(close.reason.as_str().to_string());
                }
                Some(Ok(Message::Close(_))) | None => {
                    break SessionEnd::Dropped("closed by gateway".to_string());
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(frame = %text.as_str(), "gateway frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
            }
        }
    };

    transport.lock().close(&mut rx, unsent, ConnectionState::Closed);
    end
}

async fn send_event<S>(sink: &mut S, event: &CapturedEvent) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode captured event; skipping");
            return Ok(());
        }
    };
    sink.send(Message::text(json)).await
}

/// The channel URL without its token, for logging.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
