use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::events::ConsoleEvent;
use crate::state::*;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Whether a live subscriber asking for `role` should see `event`.
fn wanted(event: &ConsoleEvent, role: Option<&str>) -> bool {
    role.map_or(true, |r| event.role == r)
}

fn frame(event: &ConsoleEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_default();
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.event_type.as_str())
        .data(data)
}

/// GET /api/events?role= -- live console events, optionally for one role.
/// Subscribers that fall behind skip the events they missed; the history
/// endpoint has them.
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let role = q.role.filter(|r| !r.is_empty());
    let events = BroadcastStream::new(state.emitter.subscribe())
        .filter_map(Result::ok)
        .filter(move |event| wanted(event, role.as_deref()))
        .map(|event| Ok::<_, Infallible>(frame(&event)));
    Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("ping"))
}

/// GET /api/events/history -- paginated event log (since_id, limit, role)
pub async fn events_history_handler(
    State(state): State<AppState>,
    Query(q): Query<EventsHistoryQuery>,
) -> Json<Vec<ConsoleEvent>> {
    let since_id = q.since_id.unwrap_or(0);
    let limit = q.limit.unwrap_or(100).min(1000);
    let events = state
        .emitter
        .event_log()
        .and_then(|log| log.query(since_id, limit, q.role.as_deref()).ok())
        .unwrap_or_default();
    Json(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(role: &str) -> ConsoleEvent {
        ConsoleEvent {
            id: 1,
            timestamp: 0,
            role: role.into(),
            event_type: "CHUNK_SERVED".into(),
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn test_role_filter() {
        assert!(wanted(&event("gate"), None));
        assert!(wanted(&event("gate"), Some("gate")));
        assert!(!wanted(&event("metadata"), Some("gate")));
    }
}
