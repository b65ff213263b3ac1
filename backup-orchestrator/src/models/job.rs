//! Run-time job aggregates and the common response envelope.
//!
//! Jobs live only for the duration of one request; nothing here is persisted.

use serde::Serialize;
use serde_json::json;

use crate::error::PipelineError;
use crate::models::request::BackendKind;
use crate::pipeline::capacity::CapacityCheck;
use crate::pipeline::estimate::SizeEstimate;
use crate::pipeline::restore::RestorePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    PartiallyFailed,
}

#[derive(Debug, Serialize)]
pub struct BackupJob {
    pub id: String,
    pub backend: BackendKind,
    pub unit: Option<String>,
    pub label: String,
    pub status: JobStatus,
    pub started_at: String,
    pub finished_at: String,
    pub estimate: SizeEstimate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityCheck>,
    pub artifact_paths: Vec<String>,
    pub files_transferred: usize,
    pub files_skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct RestoreJob {
    pub id: String,
    pub backend: BackendKind,
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: JobStatus,
    pub phase: RestorePhase,
    pub started_at: String,
    pub finished_at: String,
    pub artifact_paths: Vec<String>,
}

/// Response envelope shared by every endpoint: an explicit verdict plus a
/// typed error kind. No handler returns a silent no-op.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub status: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<String>>,
    pub error: Option<String>,
}

impl JobResponse {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: true,
            message: message.into(),
            data: Some(data),
            required_space: None,
            available_space: None,
            pending: None,
            error: None,
        }
    }

    pub fn failed(err: &PipelineError) -> Self {
        let mut resp = Self {
            status: false,
            message: err.to_string(),
            data: None,
            required_space: None,
            available_space: None,
            pending: None,
            error: Some(err.kind().to_string()),
        };
        match err {
            PipelineError::InsufficientSpace {
                required,
                available,
            } => {
                resp.required_space = Some(required.clone());
                resp.available_space = Some(available.clone());
            }
            PipelineError::PartialTransfer {
                completed,
                total,
                pending,
            } => {
                resp.pending = Some(pending.clone());
                resp.data = Some(json!({
                    "files_transferred": completed,
                    "files_total": total,
                }));
            }
            _ => {}
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_carries_both_figures() {
        let err = PipelineError::InsufficientSpace {
            required: "5.00 GB".into(),
            available: "2.00 GB".into(),
        };
        let resp = JobResponse::failed(&err);
        assert!(!resp.status);
        assert_eq!(resp.required_space.as_deref(), Some("5.00 GB"));
        assert_eq!(resp.available_space.as_deref(), Some("2.00 GB"));
        assert_eq!(resp.error.as_deref(), Some("insufficient_space_error"));
    }

    #[test]
    fn partial_transfer_lists_pending_entries() {
        let err = PipelineError::PartialTransfer {
            completed: 2,
            total: 5,
            pending: vec!["app/a.db".into(), "app/b.db".into(), "app/c.db".into()],
        };
        let resp = JobResponse::failed(&err);
        assert_eq!(resp.pending.as_ref().map(Vec::len), Some(3));
    }
}
