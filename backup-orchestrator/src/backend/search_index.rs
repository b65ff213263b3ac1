//! Search-index driver (Elasticsearch-compatible HTTP snapshot API).
//!
//! Snapshots go through a filesystem repository registered on demand; the
//! repository directory itself is the artifact. Indices whose names start
//! with a dot are system indices and never listed.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use crate::backend::{Artifact, ArtifactLocation, ArtifactRole, Backend, SnapshotInfo, UnitName};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::models::request::BackendKind;

pub struct SearchIndexBackend {
    http: reqwest::Client,
    base_url: String,
    repository: String,
    repo_path: PathBuf,
}

impl SearchIndexBackend {
    pub fn new(url: String, repository: Option<String>, config: &AppConfig) -> Self {
        let with_scheme = if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else {
            format!("http://{url}")
        };
        Self {
            http: reqwest::Client::new(),
            base_url: with_scheme.trim_end_matches('/').to_string(),
            repository: repository.unwrap_or_else(|| config.search_repo_name.clone()),
            repo_path: config.search_repo_path.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register the filesystem snapshot repository, create-if-absent.
    async fn register_repository(&self) -> Result<(), PipelineError> {
        let payload = json!({
            "type": "fs",
            "settings": { "location": self.repo_path.display().to_string() },
        });
        let resp = self
            .http
            .put(self.url(&format!("/_snapshot/{}", self.repository)))
            .json(&payload)
            .send()
            .await
            .map_err(connectivity)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::SnapshotFailed(format!(
                "repository registration failed: {body}"
            )));
        }
        Ok(())
    }

    async fn visible_indices(&self) -> Result<Vec<String>, PipelineError> {
        let resp = self
            .http
            .get(self.url("/_cat/indices?format=json"))
            .send()
            .await
            .map_err(connectivity)?;
        if !resp.status().is_success() {
            return Err(PipelineError::Connectivity(format!(
                "index listing failed with status {}",
                resp.status()
            )));
        }
        let rows: Vec<Value> = resp.json().await.map_err(connectivity)?;
        let names = rows
            .into_iter()
            .filter_map(|row| row["index"].as_str().map(str::to_string));
        Ok(filter_visible_indices(names))
    }

    /// Snapshots known to the repository.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, PipelineError> {
        let resp = self
            .http
            .get(self.url(&format!("/_snapshot/{}/_all", self.repository)))
            .send()
            .await
            .map_err(connectivity)?;
        if !resp.status().is_success() {
            return Err(PipelineError::Connectivity(format!(
                "snapshot listing failed with status {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await.map_err(connectivity)?;
        let snapshots = body["snapshots"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| {
                s["snapshot"].as_str().map(|name| SnapshotInfo {
                    name: name.to_string(),
                    unit: s["indices"]
                        .as_array()
                        .map(|idx| {
                            idx.iter()
                                .filter_map(|i| i.as_str())
                                .collect::<Vec<_>>()
                                .join(",")
                        }),
                    size: None,
                })
            })
            .collect();
        Ok(snapshots)
    }
}

#[async_trait]
impl Backend for SearchIndexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SearchIndex
    }

    async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
        Ok(self
            .visible_indices()
            .await?
            .into_iter()
            .map(UnitName::new)
            .collect())
    }

    async fn estimate_size(&self, unit: Option<&UnitName>) -> Result<u64, PipelineError> {
        let path = match unit {
            Some(u) => format!("/{u}/_stats/store"),
            None => "/_stats/store".to_string(),
        };
        let resp = self
            .http
            .get(self.url(&path))
            .send()
            .await
            .map_err(connectivity)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(PipelineError::Connectivity(format!(
                "stats query failed with status {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await.map_err(connectivity)?;
        Ok(body["_all"]["total"]["store"]["size_in_bytes"]
            .as_u64()
            .unwrap_or(0))
    }

    async fn snapshot(
        &self,
        unit: Option<&UnitName>,
        label: &str,
    ) -> Result<Vec<Artifact>, PipelineError> {
        self.register_repository().await?;

        let indices = match unit {
            Some(u) => u.to_string(),
            None => {
                let names = self.visible_indices().await?;
                if names.is_empty() {
                    return Err(PipelineError::SnapshotFailed(
                        "no indices available to snapshot".into(),
                    ));
                }
                names.join(",")
            }
        };

        let payload = json!({
            "indices": indices,
            "ignore_unavailable": true,
            "include_global_state": false,
        });
        let resp = self
            .http
            .put(self.url(&format!(
                "/_snapshot/{}/{label}?wait_for_completion=true",
                self.repository
            )))
            .json(&payload)
            .send()
            .await
            .map_err(connectivity)?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if is_duplicate_snapshot_reply(status, &body) {
            return Err(PipelineError::DuplicateSnapshot(label.to_string()));
        }
        if !status.is_success() {
            return Err(PipelineError::SnapshotFailed(body));
        }

        Ok(vec![Artifact {
            unit: unit.cloned(),
            location: ArtifactLocation::Local {
                path: self.repo_path.clone(),
            },
            role: ArtifactRole::Files,
            label: label.to_string(),
        }])
    }

    async fn restore(
        &self,
        artifact: &Artifact,
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError> {
        if let Some(u) = unit {
            self.validate_unit(u.as_str())?;
        }
        if artifact.label.is_empty() {
            return Err(PipelineError::RestoreFailed(
                "artifact carries no snapshot label".into(),
            ));
        }

        // Repository files staged outside the repo directory are placed into
        // it first, so the engine can see the snapshot.
        if let ArtifactLocation::Local { path } = &artifact.location {
            if path != &self.repo_path && path.is_dir() {
                let src = path.clone();
                let dst = self.repo_path.clone();
                let copied =
                    tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
                        .await
                        .map_err(|e| PipelineError::Internal(e.to_string()))??;
                tracing::info!(files = copied, repo = %self.repo_path.display(), "Placed snapshot files into repository");
                fix_local_ownership(&self.repo_path).await;
            }
        }

        self.register_repository().await?;

        let mut payload = json!({
            "ignore_unavailable": true,
            "include_global_state": false,
        });
        if let Some(u) = unit {
            payload["indices"] = json!(u.to_string());
        }

        let resp = self
            .http
            .post(self.url(&format!(
                "/_snapshot/{}/{}/_restore",
                self.repository, artifact.label
            )))
            .json(&payload)
            .send()
            .await
            .map_err(connectivity)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::RestoreFailed(body));
        }
        Ok(())
    }
}

/// Drop dot-prefixed system indices.
pub(crate) fn filter_visible_indices(names: impl IntoIterator<Item = String>) -> Vec<String> {
    names.into_iter().filter(|n| !n.starts_with('.')).collect()
}

/// The engine answers 400 with an invalid-snapshot-name error when the label
/// was already used.
pub(crate) fn is_duplicate_snapshot_reply(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST
        && (body.contains("invalid_snapshot_name")
            || body.contains("already in-use")
            || body.contains("already exists"))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize, PipelineError> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| PipelineError::Internal(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}

/// Hand repository files to the engine's service account. Non-fatal: a
/// failure is logged and the restore attempt proceeds.
async fn fix_local_ownership(path: &Path) {
    let result = tokio::process::Command::new("chown")
        .arg("-R")
        .arg("elasticsearch:elasticsearch")
        .arg(path)
        .output()
        .await;
    match result {
        Ok(out) if out.status.success() => {}
        Ok(out) => tracing::warn!(
            path = %path.display(),
            "ownership fix failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => tracing::warn!(path = %path.display(), "ownership fix failed: {e}"),
    }
}

fn connectivity(e: reqwest::Error) -> PipelineError {
    PipelineError::Connectivity(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_prefixed_indices_are_system_units() {
        let names = vec![
            ".kibana".to_string(),
            "app_logs".to_string(),
            ".security-7".to_string(),
            "events".to_string(),
        ];
        assert_eq!(filter_visible_indices(names), vec!["app_logs", "events"]);
    }

    #[test]
    fn duplicate_reply_is_detected_from_status_and_body() {
        assert!(is_duplicate_snapshot_reply(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"type":"invalid_snapshot_name_exception","reason":"snapshot with the same name already in-use"}}"#,
        ));
        assert!(!is_duplicate_snapshot_reply(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"type":"parse_exception"}}"#,
        ));
        assert!(!is_duplicate_snapshot_reply(StatusCode::OK, "ok"));
    }

    #[test]
    fn bare_host_gets_a_scheme() {
        let config = AppConfig::from_env();
        let backend =
            SearchIndexBackend::new("10.0.0.5:9200".into(), None, &config);
        assert_eq!(backend.base_url, "http://10.0.0.5:9200");

        let backend =
            SearchIndexBackend::new("https://search.internal/".into(), None, &config);
        assert_eq!(backend.base_url, "https://search.internal");
    }
}
