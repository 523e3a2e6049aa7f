use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use crate::errors::AppError;
use crate::models::pattern::{PatternEvent, PatternHistoryResponse};
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/patterns",
    responses(
        (status = 200, description = "Recorded pattern signals, newest first", body = PatternHistoryResponse)
    )
)]
pub async fn get_patterns(
    State(state): State<AppState>,
) -> Result<Json<PatternHistoryResponse>, AppError> {
    let events = state.market.history.read().await.clone();
    Ok(Json(PatternHistoryResponse { events }))
}

#[utoipa::path(
    get,
    path = "/patterns/stream",
    responses(
        (status = 200, description = "SSE stream: history snapshot, then each new pattern signal", content_type = "text/event-stream")
    )
)]
pub async fn get_pattern_stream(
    State(state): State<AppState>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (history, rx) = state.market.subscribe_with_history().await;

    let initial_events = match history_event(history) {
        Some(event) => vec![Ok(event)],
        None => Vec::new(),
    };
    let initial_stream = tokio_stream::iter(initial_events);

    let broadcast_stream = BroadcastStream::new(rx).filter_map(|message| match message {
        Ok(event) => pattern_event(event).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("pattern stream lagged, {} events skipped", skipped);
            None
        }
    });

    let stream = initial_stream.chain(broadcast_stream);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn history_event(history: Vec<PatternEvent>) -> Option<Event> {
    let data = serde_json::to_string(&PatternHistoryResponse { events: history }).ok()?;
    Some(Event::default().event("history").data(data))
}

fn pattern_event(event: PatternEvent) -> Option<Event> {
    let data = serde_json::to_string(&event).ok()?;
    Some(
        Event::default()
            .event("pattern")
            .id(event.timestamp.to_string())
            .data(data),
    )
}
