//! Server-sent event stream of container logs.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, stream};
use quickdock_session::{LogEnd, LogLine, LogMessage, LogTailHandle};
use serde::Deserialize;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Lines of history to replay before following.
    pub tail: Option<u32>,
}

/// `GET /api/container/{container_id}/logs`
///
/// Every line is a `line` event whose data is the JSON-encoded text; the
/// stream finishes with one `end` event carrying the reason.
///
/// # Errors
/// 404 for unknown containers, 503 when the engine is unreachable.
pub async fn container_logs(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = state.logs.open(&container_id, query.tail).await?;
    Ok(Sse::new(log_events(handle)).keep_alive(KeepAlive::default()))
}

/// Dropping the returned stream (client gone) drops the handle, which tears
/// down the engine connection.
fn log_events(handle: LogTailHandle) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(handle), |handle| async move {
        let mut handle = handle?;
        match handle.recv().await? {
            LogMessage::Line(line) => Some((Ok(line_event(&line)), Some(handle))),
            LogMessage::Ended(end) => Some((Ok(end_event(&end)), None)),
        }
    })
}

fn line_event(line: &LogLine) -> Event {
    Event::default()
        .event("line")
        .json_data(&line.text)
        .unwrap_or_default()
}

fn end_event(end: &LogEnd) -> Event {
    Event::default().event("end").json_data(end).unwrap_or_default()
}
