//! HTTP API for cohort building and conversational querying.

pub mod routes;
pub mod state;

use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cohortd_compiler::CompileError;
use cohortd_conversation::AskError;
use cohortd_warehouse::{AggregateError, QueryExecutionError};

pub use state::AppState;

/// Error envelope returned by every handler, mapping domain errors onto
/// HTTP statuses: validation 422, turn-in-flight 409, warehouse 502.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<CompileError> for ApiError {
    fn from(err: CompileError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
    }
}

impl From<QueryExecutionError> for ApiError {
    fn from(err: QueryExecutionError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<AggregateError> for ApiError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::Compile(e) => e.into(),
            AggregateError::Warehouse(e) => e.into(),
        }
    }
}

impl From<AskError> for ApiError {
    fn from(err: AskError) -> Self {
        match err {
            AskError::TurnInFlight { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            AskError::Warehouse(e) => e.into(),
            AskError::Compile(e) => e.into(),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "service": "cohortd" }))
}

/// Assemble the full application router. An empty origin list opens CORS
/// up entirely (development mode).
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
    };

    Router::new()
        .route("/api/health", get(health))
        .nest("/api", routes::api_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16, cors_origins: &[String]) -> anyhow::Result<()> {
    let app = router(state, cors_origins);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "cohortd api listening");
    axum::serve(listener, app).await?;
    Ok(())
}
