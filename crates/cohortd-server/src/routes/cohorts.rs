use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use cohortd_compiler::compile;
use cohortd_schema::CohortDefinition;
use cohortd_warehouse::{CohortResult, SavedCohort};

use crate::state::AppState;
use crate::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/compile", post(compile_cohort))
        .route("/build", post(build_cohort))
        .route("/preview-count", post(preview_count))
        .route("/save", post(save_cohort))
}

#[derive(Serialize)]
struct CompileResponse {
    sql: String,
}

async fn compile_cohort(
    State(state): State<AppState>,
    Json(definition): Json<CohortDefinition>,
) -> Result<Json<CompileResponse>, ApiError> {
    let sql = compile(&definition, &state.compiler)?;
    Ok(Json(CompileResponse { sql }))
}

async fn build_cohort(
    State(state): State<AppState>,
    Json(definition): Json<CohortDefinition>,
) -> Result<Json<CohortResult>, ApiError> {
    let result = state.aggregator.build_cohort(&definition).await?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct PreviewResponse {
    count: i64,
}

async fn preview_count(
    State(state): State<AppState>,
    Json(definition): Json<CohortDefinition>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let count = state.aggregator.preview_count(&definition).await?;
    Ok(Json(PreviewResponse { count }))
}

#[derive(Deserialize)]
struct SaveCohortRequest {
    name: String,
    #[serde(default)]
    description: String,
    definition: CohortDefinition,
}

async fn save_cohort(
    State(state): State<AppState>,
    Json(request): Json<SaveCohortRequest>,
) -> Result<Json<SavedCohort>, ApiError> {
    let sql = compile(&request.definition, &state.compiler)?;
    let saved = state
        .aggregator
        .save_cohort(&request.name, &request.description, &sql)
        .await?;
    Ok(Json(saved))
}
