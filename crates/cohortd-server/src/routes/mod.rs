pub mod ask;
pub mod cohorts;
pub mod concepts;
pub mod sessions;
pub mod stats;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/concepts", concepts::router())
        .nest("/cohorts", cohorts::router())
        .nest("/ask", ask::router())
        .nest("/sessions", sessions::router())
        .nest("/stats", stats::router())
}
