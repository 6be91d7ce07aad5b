//! `GET /events`: every hub event as Server-Sent Events.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tracing::{debug, warn};

use super::AppState;

/// The stream ends when the hub stops, so graceful shutdown is not held
/// open by idle subscribers.
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.hub.events().subscribe();
    let mut shutdown = state.hub.shutdown_signal();
    debug!(subscribers = state.hub.events().subscriber_count(), "SSE subscriber connected");

    let stream = async_stream::stream! {
        loop {
            let received = tokio::select! {
                // Drain what is already queued before honouring a stop.
                biased;
                received = rx.recv() => received,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            match received {
                Ok(event) => match SseEvent::default().event(event.kind.as_str()).json_data(&event) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("SSE subscriber closed");
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
