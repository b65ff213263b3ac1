//! Object-store driver (S3-compatible API, path-style addressing for
//! MinIO-style deployments).
//!
//! An object store has no native dump primitive, so a snapshot is a download
//! of every object into a label-scoped staging directory, preserving key
//! paths; restore uploads the tree back.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use std::path::{Path, PathBuf};

use crate::backend::{Artifact, ArtifactLocation, ArtifactRole, Backend, UnitName};
use crate::error::PipelineError;
use crate::models::request::BackendKind;

pub struct ObjectStoreBackend {
    client: aws_sdk_s3::Client,
    staging_dir: PathBuf,
}

impl ObjectStoreBackend {
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        region: Option<&str>,
        staging_dir: PathBuf,
    ) -> Self {
        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        let credentials = Credentials::new(access_key, secret_key, None, None, "request");
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.unwrap_or("us-east-1").to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            staging_dir,
        }
    }

    async fn bucket_names(&self) -> Result<Vec<String>, PipelineError> {
        let resp = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(connectivity)?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn bucket_size(&self, bucket: &str) -> Result<u64, PipelineError> {
        let mut total: u64 = 0;
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(connectivity)?;
            for obj in page.contents() {
                total += obj.size().unwrap_or(0).max(0) as u64;
            }
        }
        Ok(total)
    }

    async fn dump_bucket(&self, bucket: &str, root: &Path) -> Result<usize, PipelineError> {
        tokio::fs::create_dir_all(root).await?;
        let mut dumped = 0;
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(connectivity)?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                if !is_safe_key(key) {
                    tracing::warn!(bucket, key, "skipping object with unsafe key");
                    continue;
                }
                let resp = self
                    .client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        PipelineError::SnapshotFailed(format!(
                            "failed to read object '{key}': {}",
                            DisplayErrorContext(e)
                        ))
                    })?;
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| PipelineError::SnapshotFailed(e.to_string()))?
                    .into_bytes();
                let target = root.join(key);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, data).await?;
                dumped += 1;
            }
        }
        Ok(dumped)
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), PipelineError> {
        if self
            .client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                PipelineError::RestoreFailed(format!(
                    "could not create bucket '{bucket}': {}",
                    DisplayErrorContext(e)
                ))
            })?;
        Ok(())
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn validate_unit(&self, name: &str) -> Result<(), PipelineError> {
        validate_bucket_name(name)
    }

    async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
        Ok(self
            .bucket_names()
            .await?
            .into_iter()
            .map(UnitName::new)
            .collect())
    }

    async fn estimate_size(&self, unit: Option<&UnitName>) -> Result<u64, PipelineError> {
        match unit {
            Some(u) => self.bucket_size(u.as_str()).await,
            None => {
                let mut total = 0;
                for bucket in self.bucket_names().await? {
                    total += self.bucket_size(&bucket).await?;
                }
                Ok(total)
            }
        }
    }

    async fn snapshot(
        &self,
        unit: Option<&UnitName>,
        label: &str,
    ) -> Result<Vec<Artifact>, PipelineError> {
        let dump_root = self.staging_dir.join("object_store").join(label);
        if dump_root.exists() {
            return Err(PipelineError::DuplicateSnapshot(label.to_string()));
        }

        let buckets = match unit {
            Some(u) => vec![u.clone()],
            None => self
                .bucket_names()
                .await?
                .into_iter()
                .map(UnitName::new)
                .collect(),
        };

        let mut artifacts = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let bucket_root = dump_root.join(bucket.as_str());
            let dumped = self.dump_bucket(bucket.as_str(), &bucket_root).await?;
            tracing::info!(bucket = %bucket, objects = dumped, "Dumped bucket");
            artifacts.push(Artifact {
                unit: Some(bucket),
                location: ArtifactLocation::Local { path: bucket_root },
                role: ArtifactRole::Files,
                label: label.to_string(),
            });
        }
        Ok(artifacts)
    }

    async fn restore(
        &self,
        artifact: &Artifact,
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError> {
        let bucket = unit
            .or(artifact.unit.as_ref())
            .ok_or_else(|| {
                PipelineError::RestoreFailed("a bucket name is required for restore".into())
            })?
            .clone();
        self.validate_unit(bucket.as_str())?;

        let ArtifactLocation::Local { path } = &artifact.location else {
            return Err(PipelineError::RestoreFailed(
                "artifact must be staged locally before upload".into(),
            ));
        };

        self.ensure_bucket(bucket.as_str()).await?;

        let mut restored = 0;
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry.map_err(|e| PipelineError::Internal(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let key = entry
                .path()
                .strip_prefix(path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let body = ByteStream::from_path(entry.path())
                .await
                .map_err(|e| PipelineError::RestoreFailed(e.to_string()))?;
            self.client
                .put_object()
                .bucket(bucket.as_str())
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    PipelineError::RestoreFailed(format!(
                        "failed to upload '{key}': {}",
                        DisplayErrorContext(e)
                    ))
                })?;
            restored += 1;
        }
        tracing::info!(bucket = %bucket, objects = restored, "Restored bucket");
        Ok(())
    }
}

fn connectivity<E>(e: E) -> PipelineError
where
    E: std::error::Error + Send + Sync + 'static,
{
    PipelineError::Connectivity(format!("{}", DisplayErrorContext(e)))
}

/// Bucket naming rule: 3-63 chars of lowercase letters, digits, dots and
/// hyphens, starting and ending alphanumeric.
pub(crate) fn validate_bucket_name(name: &str) -> Result<(), PipelineError> {
    let bytes = name.as_bytes();
    let valid = bytes.len() >= 3
        && bytes.len() <= 63
        && (bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit())
        && (bytes[bytes.len() - 1].is_ascii_lowercase() || bytes[bytes.len() - 1].is_ascii_digit())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'.' || *b == b'-');
    if !valid {
        return Err(PipelineError::InvalidName(format!(
            "'{name}' is not a valid bucket name"
        )));
    }
    Ok(())
}

/// Keys become staging file paths; refuse anything that could escape the
/// dump directory.
pub(crate) fn is_safe_key(key: &str) -> bool {
    !key.starts_with('/') && !key.split('/').any(|part| part == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_bucket_names() {
        assert!(validate_bucket_name("backups").is_ok());
        assert!(validate_bucket_name("app-data.2024").is_ok());
        assert!(validate_bucket_name("abc").is_ok());
    }

    #[test]
    fn rejects_invalid_bucket_names() {
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Uppercase").is_err());
        assert!(validate_bucket_name("-leading").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
        assert!(validate_bucket_name("under_score").is_err());
        assert!(validate_bucket_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn traversal_keys_are_unsafe() {
        assert!(is_safe_key("data/2024/part-0.parquet"));
        assert!(!is_safe_key("../etc/passwd"));
        assert!(!is_safe_key("data/../../etc/passwd"));
        assert!(!is_safe_key("/absolute"));
    }
}
