use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;

/// Typed failure of one backup/restore pipeline stage.
///
/// Connectivity and capacity failures are terminal for a job and reported
/// without attempting later stages. Partial transfers carry the pending
/// manifest entries so a caller can retry only the missing subset.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("backend unreachable: {0}")]
    Connectivity(String),

    #[error("remote host unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("invalid unit name: {0}")]
    InvalidName(String),

    #[error("snapshot label '{0}' is already in use")]
    DuplicateSnapshot(String),

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("snapshot completed but its artifacts could not be located: {0}")]
    ArtifactNotFound(String),

    #[error("could not parse disk usage output: {0}")]
    DiskQueryParse(String),

    #[error("not enough space on the destination: required {required}, available {available}")]
    InsufficientSpace { required: String, available: String },

    #[error("transfer incomplete: {completed} of {total} files copied")]
    PartialTransfer {
        completed: usize,
        total: usize,
        pending: Vec<String>,
    },

    #[error("data load attempted before schema load completed")]
    RestoreOrdering,

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable kind, carried in every failure response.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Connectivity(_) => "connectivity_error",
            PipelineError::RemoteUnreachable(_) => "remote_unreachable_error",
            PipelineError::InvalidName(_) => "invalid_name_error",
            PipelineError::DuplicateSnapshot(_) => "duplicate_snapshot_error",
            PipelineError::SnapshotFailed(_) => "snapshot_failed_error",
            PipelineError::ArtifactNotFound(_) => "artifact_not_found_error",
            PipelineError::DiskQueryParse(_) => "disk_query_parse_error",
            PipelineError::InsufficientSpace { .. } => "insufficient_space_error",
            PipelineError::PartialTransfer { .. } => "partial_transfer_error",
            PipelineError::RestoreOrdering => "restore_ordering_error",
            PipelineError::RestoreFailed(_) => "restore_failed_error",
            PipelineError::Timeout(_) => "timeout_error",
            PipelineError::Io(_) => "io_error",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for a job that failed with this error: 404 for remote
    /// connectivity, 406 for preconditions, 400 for everything inside the
    /// pipeline.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Connectivity(_) | PipelineError::RemoteUnreachable(_) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::InsufficientSpace { .. } => StatusCode::NOT_ACCEPTABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Request-boundary errors raised before a job is started.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg, kind) = match &self {
            AppError::PreconditionFailed(m) => {
                (StatusCode::NOT_ACCEPTABLE, m.clone(), "precondition_failed")
            }
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), "bad_request"),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                    "internal_error",
                )
            }
        };
        let body = json!({
            "status": false,
            "message": msg,
            "error": kind,
        });
        (status, Json(body)).into_response()
    }
}
