use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use ultrametre_core::SubscriberId;

use crate::state::AppState;

/// Keep-alive comments double as disconnect detection
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Logs when the stream generator is dropped (client gone).
struct DisconnectLog(SubscriberId);

impl Drop for DisconnectLog {
    fn drop(&mut self) {
        log::info!("[sse] Subscriber {} disconnected", self.0);
    }
}

// ============================================
// SSE Handler (GET /bridge/events)
// ============================================

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.bridge.hub().subscribe();
    let id = subscription.id();
    log::info!("[sse] Subscriber {} connected", id);

    // When the client disconnects, axum drops this generator on the next
    // keep-alive write. The subscription is dropped with it and unsubscribes.
    let stream = async_stream::stream! {
        let _disconnect = DisconnectLog(id);

        while let Some(event) = subscription.recv().await {
            yield Ok(Event::default()
                .event(event.name())
                .data(event.data().to_string()));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default().interval(KEEP_ALIVE_INTERVAL))
}
