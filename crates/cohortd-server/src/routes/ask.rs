use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use cohortd_nlq::TurnStatus;
use cohortd_schema::CohortAnswer;

use crate::state::AppState;
use crate::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(ask))
        .route("/{session_id}/{message_id}/status", get(turn_status))
}

#[derive(Deserialize)]
struct AskRequest {
    #[serde(default)]
    session_id: Option<String>,
    text: String,
}

#[derive(Serialize)]
struct AskResponse {
    session_id: String,
    answer: CohortAnswer,
}

async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let result = state
        .orchestrator
        .ask(request.session_id.as_deref(), &request.text)
        .await?;
    Ok(Json(AskResponse {
        session_id: result.session.session_id.clone(),
        answer: result.answer,
    }))
}

#[derive(Serialize)]
struct TurnStatusResponse {
    status: TurnStatus,
}

/// Progress side-channel for an in-flight turn; 404 once it has resolved.
async fn turn_status(
    State(state): State<AppState>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Result<Json<TurnStatusResponse>, ApiError> {
    match state
        .orchestrator
        .tracker()
        .status(&session_id, &message_id)
    {
        Some(status) => Ok(Json(TurnStatusResponse { status })),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no turn in flight for that id",
        )),
    }
}
