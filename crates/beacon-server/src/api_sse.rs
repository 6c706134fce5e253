//! SSE event stream handlers.

use crate::api_query::{authorize, ApiError, QueryParams};
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::{sse::Event, Sse},
};
use futures_util::Stream;
use std::{convert::Infallible, sync::Arc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Handler for `GET /api/subjects/{subject}/stream`.
///
/// Streams every event stored for the subject from now on, read from its
/// notifier topic. SSE event names are the event kinds.
pub async fn get_subject_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subject = authorize(&state, &headers, params.token.as_deref(), &subject)?;
    let rx = state.notifier.subscribe(&subject);
    let stream = BroadcastStream::new(rx);

    let mapped_stream = stream.filter_map(move |result| match result {
        Ok(event) => match serde_json::to_string(&*event) {
            Ok(data) => Some(Ok(Event::default()
                .event(event.kind().as_str())
                .id(event.seq.to_string())
                .data(data))),
            Err(e) => {
                tracing::error!("failed to serialize stored event for SSE: {}", e);
                None
            }
        },
        Err(broadcast_error) => {
            tracing::warn!(
                subject = %subject,
                error = %broadcast_error,
                "subject SSE stream lagged; events were dropped for this subscriber"
            );
            None
        }
    });

    Ok(Sse::new(mapped_stream).keep_alive(axum::response::sse::KeepAlive::default()))
}
