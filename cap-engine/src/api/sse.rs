//! Server-Sent Events stream of engine events

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /api/events
///
/// Streams every `EngineEvent` (tier upgrades, scheduled cycles, evaluated
/// batches, revenue distributions) as it is published.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    cap_common::sse::create_event_sse_stream("cap-engine", &state.event_bus)
}
