use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use cohortd_warehouse::DatabaseSummary;

use crate::state::AppState;
use crate::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/summary", get(summary))
}

async fn summary(State(state): State<AppState>) -> Result<Json<DatabaseSummary>, ApiError> {
    let summary = state.aggregator.stats_summary().await?;
    Ok(Json(summary))
}
