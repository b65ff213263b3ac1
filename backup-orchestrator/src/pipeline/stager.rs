//! Snapshot triggering: label generation and artifact handover.

use chrono::Utc;

use crate::backend::{Artifact, Backend, UnitName};
use crate::error::PipelineError;

/// Timestamp-based label used when the caller supplies none.
pub fn generate_label(unit: Option<&UnitName>) -> String {
    let ts = Utc::now().timestamp();
    match unit {
        Some(u) => format!("{ts}_snapshot_{u}"),
        None => format!("{ts}_snapshot"),
    }
}

/// Drive the backend's native capture and hand back the located artifacts.
///
/// A snapshot that reports success but yields no artifacts is surfaced as
/// `ArtifactNotFound` rather than swallowed, so an operator can go find the
/// capture manually.
pub async fn stage(
    backend: &dyn Backend,
    unit: Option<&UnitName>,
    label: Option<String>,
) -> Result<(String, Vec<Artifact>), PipelineError> {
    let label = label.unwrap_or_else(|| generate_label(unit));

    let artifacts = backend.snapshot(unit, &label).await.map_err(|e| match e {
        PipelineError::DuplicateSnapshot(_)
        | PipelineError::Connectivity(_)
        | PipelineError::InvalidName(_)
        | PipelineError::SnapshotFailed(_)
        | PipelineError::ArtifactNotFound(_) => e,
        other => PipelineError::SnapshotFailed(other.to_string()),
    })?;

    if artifacts.is_empty() {
        return Err(PipelineError::ArtifactNotFound(format!(
            "backend reported success but produced nothing for label '{label}'"
        )));
    }

    Ok((label, artifacts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_includes_unit_when_named() {
        let unit = UnitName::new("app_logs");
        let label = generate_label(Some(&unit));
        assert!(label.ends_with("_snapshot_app_logs"));
        let ts: i64 = label.split('_').next().unwrap().parse().unwrap();
        assert!(ts > 0);
    }

    #[test]
    fn label_without_unit_is_bare() {
        let label = generate_label(None);
        assert!(label.ends_with("_snapshot"));
    }
}
