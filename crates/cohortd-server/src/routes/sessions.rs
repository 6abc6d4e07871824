use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use cohortd_schema::ConversationSession;

use crate::state::AppState;
use crate::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions))
        .route("/{session_id}", get(get_session))
        .route("/{session_id}/reset", axum::routing::post(reset_session))
}

#[derive(Serialize)]
struct SessionSummary {
    session_id: String,
    message_count: usize,
    last_active: String,
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    let sessions = state.orchestrator.sessions().await;
    Json(
        sessions
            .iter()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                message_count: s.messages.len(),
                last_active: s.last_active.to_rfc3339(),
            })
            .collect(),
    )
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ConversationSession>, ApiError> {
    match state.orchestrator.session(&session_id).await {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "session not found")),
    }
}

async fn reset_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.orchestrator.reset(&session_id).await {
        Ok(Json(
            serde_json::json!({ "status": "reset", "session_id": session_id }),
        ))
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "session not found"))
    }
}
