//! Read-only HTTP endpoints over the conversation log and call usage.
//!
//! - `GET /api/conversations/{conversationId}/events` ordered event log
//! - `GET /api/calls/{callId}/usage` usage reported at call teardown

use crate::session::SessionError;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parlance_store::{get_usage, list_events, CallUsage, ConversationEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters for the event log.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Only events with a larger sequence number are returned.
    pub after_seq: Option<i64>,
    /// Maximum number of events to return (default: 200, max: 1000).
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub conversation_id: String,
    pub events: Vec<ConversationEvent>,
    pub count: usize,
}

fn internal_error(context: &'static str, error: impl std::fmt::Display) -> Response {
    tracing::error!(error = %error, "{}", context);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": context })),
    )
        .into_response()
}

/// Handler for `GET /api/conversations/{conversationId}/events`.
pub async fn list_conversation_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, Response> {
    let pool = state.pool.clone();
    let id = conversation_id.clone();
    let events = tokio::task::spawn_blocking(move || -> Result<_, SessionError> {
        let conn = pool.get()?;
        Ok(list_events(&conn, &id, params.after_seq, params.limit)?)
    })
    .await
    .map_err(|e| internal_error("event query task failed", e))?
    .map_err(|e| internal_error("failed to list conversation events", e))?;

    Ok(Json(EventsResponse {
        conversation_id,
        count: events.len(),
        events,
    }))
}

/// Handler for `GET /api/calls/{callId}/usage`.
pub async fn get_call_usage_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<CallUsage>, Response> {
    let pool = state.pool.clone();
    let id = call_id.clone();
    let usage = tokio::task::spawn_blocking(move || -> Result<_, SessionError> {
        let conn = pool.get()?;
        Ok(get_usage(&conn, &id)?)
    })
    .await
    .map_err(|e| internal_error("usage query task failed", e))?
    .map_err(|e| internal_error("failed to read call usage", e))?;

    match usage {
        Some(usage) => Ok(Json(usage)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no usage recorded for call {call_id}") })),
        )
            .into_response()),
    }
}
