use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::backend::{self, UnitName};
use crate::error::AppError;
use crate::models::job::JobResponse;
use crate::models::request::{BackendTarget, BackupRequest, TargetRequest};
use crate::pipeline::{estimate, BackupPlan};
use crate::routes::failure;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(run_backup))
        .route("/size", post(estimate_size))
}

async fn run_backup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BackupRequest>,
) -> Response {
    let destination = match req.destination.validate() {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    let backend = backend::build(req.target, &state.config, state.connector.clone());
    let unit = match req.unit {
        Some(raw) => match backend.validate_unit(&raw) {
            Ok(()) => Some(UnitName::new(raw)),
            Err(e) => return failure(&e),
        },
        None => None,
    };

    let plan = BackupPlan {
        unit,
        destination,
        label: req.label,
        overwrite: req.overwrite,
    };
    match state.orchestrator().run_backup(backend, plan).await {
        Ok(job) => match serde_json::to_value(&job) {
            Ok(data) => {
                (StatusCode::OK, Json(JobResponse::ok("Backup done.", data))).into_response()
            }
            Err(e) => AppError::Internal(e.into()).into_response(),
        },
        Err(e) => failure(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SizeRequest {
    #[serde(flatten)]
    pub target: BackendTarget,
    #[serde(default)]
    pub unit: Option<String>,
}

async fn estimate_size(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SizeRequest>,
) -> Response {
    let backend = backend::build(req.target, &state.config, state.connector.clone());
    let unit = match req.unit {
        Some(raw) => match backend.validate_unit(&raw) {
            Ok(()) => Some(UnitName::new(raw)),
            Err(e) => return failure(&e),
        },
        None => None,
    };

    match estimate::estimate(backend.as_ref(), unit.as_ref()).await {
        Ok(est) => match serde_json::to_value(&est) {
            Ok(data) => {
                (StatusCode::OK, Json(JobResponse::ok("Estimated size.", data))).into_response()
            }
            Err(e) => AppError::Internal(e.into()).into_response(),
        },
        Err(e) => failure(&e),
    }
}

/// List backupable units with per-unit and total sizes.
pub async fn list_units(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TargetRequest>,
) -> Response {
    let backend = backend::build(req.target, &state.config, state.connector.clone());
    match estimate::estimate(backend.as_ref(), None).await {
        Ok(est) => match serde_json::to_value(&est) {
            Ok(data) => (
                StatusCode::OK,
                Json(JobResponse::ok("List of backupable units.", data)),
            )
                .into_response(),
            Err(e) => AppError::Internal(e.into()).into_response(),
        },
        Err(e) => failure(&e),
    }
}
