pub mod backup;
pub mod health;
pub mod restore;

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::PipelineError;
use crate::models::job::JobResponse;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/backup", backup::router())
        .nest("/api/restore", restore::router())
        .route("/api/units", post(backup::list_units))
        .route("/api/snapshots", post(restore::list_snapshots))
        .route("/api/health", get(health::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Map a pipeline failure to its status code with the standard envelope.
pub(crate) fn failure(err: &PipelineError) -> Response {
    (err.status(), Json(JobResponse::failed(err))).into_response()
}
