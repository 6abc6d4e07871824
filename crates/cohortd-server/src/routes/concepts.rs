use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use cohortd_schema::Concept;
use cohortd_warehouse::ConceptSearchRequest;

use crate::state::AppState;
use crate::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/search", post(search_concepts))
        .route("/{concept_id}", get(get_concept))
}

async fn search_concepts(
    State(state): State<AppState>,
    Json(request): Json<ConceptSearchRequest>,
) -> Result<Json<Vec<Concept>>, ApiError> {
    let concepts = state.concepts.search_concepts(&request).await?;
    Ok(Json(concepts))
}

async fn get_concept(
    State(state): State<AppState>,
    Path(concept_id): Path<i64>,
) -> Result<Json<Concept>, ApiError> {
    use cohortd_warehouse::ConceptResolver;

    match state.concepts.concept_by_id(concept_id).await? {
        Some(concept) => Ok(Json(concept)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "concept not found")),
    }
}
