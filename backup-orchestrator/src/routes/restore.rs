use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use crate::backend::search_index::SearchIndexBackend;
use crate::backend::wide_column::WideColumnBackend;
use crate::backend::{self, UnitName};
use crate::error::AppError;
use crate::models::job::JobResponse;
use crate::models::request::{BackendTarget, RestoreRequest, TargetRequest};
use crate::pipeline::restore::RestorePhase;
use crate::pipeline::RestorePlan;
use crate::remote::RemoteHost;
use crate::routes::failure;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(run_restore))
        .route("/activate", post(activate))
}

async fn run_restore(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RestoreRequest>,
) -> Response {
    let source = match req.source.validate() {
        Ok(s) => s,
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

    let plan = RestorePlan {
        unit,
        source,
        label: req.label,
    };
    match state.orchestrator().run_restore(backend, plan).await {
        Ok(job) => match serde_json::to_value(&job) {
            Ok(data) => {
                (StatusCode::OK, Json(JobResponse::ok("Restore done.", data))).into_response()
            }
            Err(e) => AppError::Internal(e.into()).into_response(),
        },
        Err(e) => failure(&e),
    }
}

/// Deliberate post-restore service restart. Restarting a live storage
/// service is disruptive, so it is a separate operator action rather than an
/// automatic part of the restore flow.
async fn activate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TargetRequest>,
) -> Response {
    match req.target {
        BackendTarget::WideColumnStore {
            host,
            ssh_port,
            ssh_user,
            ssh_password,
        } => {
            let backend = WideColumnBackend::new(
                RemoteHost {
                    host,
                    port: ssh_port,
                    user: ssh_user,
                    password: ssh_password,
                },
                state.connector.clone(),
                &state.config,
            );
            match backend.restart_service().await {
                Ok(()) => (
                    StatusCode::OK,
                    Json(JobResponse::ok(
                        "Storage service restarted.",
                        json!({ "phase": RestorePhase::Activated }),
                    )),
                )
                    .into_response(),
                Err(e) => failure(&e),
            }
        }
        _ => AppError::BadRequest(
            "service activation is only defined for the wide-column store".into(),
        )
        .into_response(),
    }
}

/// List snapshots for backends that can enumerate them.
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TargetRequest>,
) -> Response {
    let snapshots = match req.target {
        BackendTarget::SearchIndex { url, repository } => {
            SearchIndexBackend::new(url, repository, &state.config)
                .list_snapshots()
                .await
        }
        BackendTarget::WideColumnStore {
            host,
            ssh_port,
            ssh_user,
            ssh_password,
        } => {
            WideColumnBackend::new(
                RemoteHost {
                    host,
                    port: ssh_port,
                    user: ssh_user,
                    password: ssh_password,
                },
                state.connector.clone(),
                &state.config,
            )
            .list_snapshots()
            .await
        }
        _ => {
            return AppError::BadRequest(
                "snapshot listing is not supported for this backend".into(),
            )
            .into_response()
        }
    };

    match snapshots {
        Ok(snaps) => (
            StatusCode::OK,
            Json(JobResponse::ok(
                "List of available snapshots.",
                json!(snaps),
            )),
        )
            .into_response(),
        Err(e) => failure(&e),
    }
}
