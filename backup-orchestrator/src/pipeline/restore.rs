//! Restore pipeline: locate artifacts at a backup source, stage them locally,
//! and drive the backend's native load.
//!
//! Staging exists because most backends require their live storage directory
//! to be owned by their own service account and refuse direct writes from an
//! SSH session running as another user; pulling files through a local staging
//! area isolates the permission fix to the final placement step.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{Artifact, ArtifactLocation, ArtifactRole, Backend, UnitName};
use crate::error::PipelineError;
use crate::models::request::Destination;
use crate::remote::{download_tree, RemoteConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Located,
    Staged,
    Loaded,
    Activated,
}

/// Enumerate candidate artifacts at a backup source. A named unit selects
/// only its artifacts; unit-agnostic artifacts (server-wide dumps) always
/// stay in scope.
pub fn locate(
    connector: &dyn RemoteConnector,
    source: &Destination,
    unit: Option<&UnitName>,
    label: Option<&str>,
) -> Result<Vec<Artifact>, PipelineError> {
    let mut artifacts = match source {
        Destination::Local { path } => {
            let root = match label {
                Some(l) => path.join(l),
                None => path.clone(),
            };
            if !root.is_dir() {
                return Err(PipelineError::ArtifactNotFound(format!(
                    "no backup found at {}",
                    root.display()
                )));
            }
            let effective_label = label
                .map(str::to_string)
                .or_else(|| root.file_name().map(|n| n.to_string_lossy().to_string()))
                .unwrap_or_default();

            let mut entries: Vec<_> = std::fs::read_dir(&root)?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.file_name());

            let mut found = Vec::new();
            for entry in entries {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                found.push(artifact_for_entry(
                    &name,
                    is_dir,
                    ArtifactLocation::Local { path: entry.path() },
                    &effective_label,
                ));
            }
            found
        }
        Destination::Remote { host, path } => {
            let shell = connector.connect(host)?;
            let root = match label {
                Some(l) => format!("{}/{}", path.trim_end_matches('/'), l),
                None => path.clone(),
            };
            if !shell.exists(&root)? {
                return Err(PipelineError::ArtifactNotFound(format!(
                    "no backup found at {}:{root}",
                    host.host
                )));
            }
            let effective_label = label
                .map(str::to_string)
                .or_else(|| root.rsplit('/').next().map(str::to_string))
                .unwrap_or_default();

            let mut entries = shell.read_dir(&root)?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            entries
                .into_iter()
                .map(|entry| {
                    let child = format!("{}/{}", root.trim_end_matches('/'), entry.name);
                    artifact_for_entry(
                        &entry.name,
                        entry.is_dir,
                        ArtifactLocation::Remote {
                            host: host.clone(),
                            path: child,
                        },
                        &effective_label,
                    )
                })
                .collect()
        }
    };

    if let Some(wanted) = unit {
        artifacts.retain(|a| match &a.unit {
            Some(u) => u == wanted,
            None => true,
        });
    }

    if artifacts.is_empty() {
        return Err(PipelineError::ArtifactNotFound(
            "backup contains no matching artifacts".into(),
        ));
    }
    Ok(artifacts)
}

fn artifact_for_entry(
    name: &str,
    is_dir: bool,
    location: ArtifactLocation,
    label: &str,
) -> Artifact {
    if is_dir {
        return Artifact {
            unit: Some(UnitName::new(name)),
            location,
            role: ArtifactRole::Files,
            label: label.to_string(),
        };
    }
    let role = if name.contains("_schema") {
        ArtifactRole::Schema
    } else if name.ends_with(".sql") {
        ArtifactRole::Data
    } else {
        ArtifactRole::Files
    };
    Artifact {
        unit: None,
        location,
        role,
        label: label.to_string(),
    }
}

/// Copy remote-source artifacts into the local staging area. Local artifacts
/// pass through untouched.
pub fn stage(
    connector: &dyn RemoteConnector,
    staging_dir: &Path,
    job_id: &str,
    artifacts: Vec<Artifact>,
) -> Result<Vec<Artifact>, PipelineError> {
    let mut staged = Vec::with_capacity(artifacts.len());
    for (idx, artifact) in artifacts.into_iter().enumerate() {
        match &artifact.location {
            ArtifactLocation::Local { .. } => staged.push(artifact),
            ArtifactLocation::Remote { host, path } => {
                let shell = connector.connect(host)?;
                let name = path.rsplit('/').next().unwrap_or("artifact").to_string();
                let local = staging_dir
                    .join("restore")
                    .join(job_id)
                    .join(idx.to_string())
                    .join(&name);
                download_tree(shell.as_ref(), path, &local)?;
                staged.push(Artifact {
                    unit: artifact.unit,
                    location: ArtifactLocation::Local { path: local },
                    role: artifact.role,
                    label: artifact.label,
                });
            }
        }
    }
    Ok(staged)
}

/// Drives `Backend::restore`, enforcing schema-before-data ordering for
/// backends with schema/data separation.
pub struct RestoreLoader {
    backend: Arc<dyn Backend>,
    schema_loaded: bool,
}

impl RestoreLoader {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            schema_loaded: false,
        }
    }

    /// Load a single artifact. Data artifacts reference schema objects, so
    /// loading one before the schema completed is an ordering violation, not
    /// a best-effort attempt.
    pub async fn load(
        &mut self,
        artifact: &Artifact,
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError> {
        if artifact.role == ArtifactRole::Data
            && self.backend.schema_before_data()
            && !self.schema_loaded
        {
            return Err(PipelineError::RestoreOrdering);
        }

        self.backend.restore(artifact, unit).await?;

        if artifact.role == ArtifactRole::Schema {
            self.schema_loaded = true;
        }
        Ok(())
    }

    /// Load every artifact, schema first.
    pub async fn load_all(
        &mut self,
        artifacts: &[Artifact],
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError> {
        let mut ordered: Vec<&Artifact> = artifacts.iter().collect();
        ordered.sort_by_key(|a| a.role);
        for artifact in ordered {
            self.load(artifact, unit).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::BackendKind;
    use crate::remote::{RemoteHost, RemoteShell};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct NoConnector;

    impl RemoteConnector for NoConnector {
        fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn RemoteShell>, PipelineError> {
            Err(PipelineError::RemoteUnreachable(host.host.clone()))
        }
    }

    struct RecordingBackend {
        ordered: bool,
        loads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::RelationalDb
        }

        fn schema_before_data(&self) -> bool {
            self.ordered
        }

        async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
            Ok(vec![])
        }

        async fn estimate_size(&self, _unit: Option<&UnitName>) -> Result<u64, PipelineError> {
            Ok(0)
        }

        async fn snapshot(
            &self,
            _unit: Option<&UnitName>,
            _label: &str,
        ) -> Result<Vec<Artifact>, PipelineError> {
            Ok(vec![])
        }

        async fn restore(
            &self,
            artifact: &Artifact,
            _unit: Option<&UnitName>,
        ) -> Result<(), PipelineError> {
            self.loads.lock().unwrap().push(format!("{:?}", artifact.role));
            Ok(())
        }
    }

    fn artifact(role: ArtifactRole) -> Artifact {
        Artifact {
            unit: None,
            location: ArtifactLocation::Local {
                path: PathBuf::from("/tmp/x"),
            },
            role,
            label: "snap1".into(),
        }
    }

    #[tokio::test]
    async fn data_before_schema_is_rejected() {
        let backend = Arc::new(RecordingBackend {
            ordered: true,
            loads: Mutex::new(vec![]),
        });
        let mut loader = RestoreLoader::new(backend.clone());

        let err = loader
            .load(&artifact(ArtifactRole::Data), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RestoreOrdering));
        assert!(backend.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_all_orders_schema_first() {
        let backend = Arc::new(RecordingBackend {
            ordered: true,
            loads: Mutex::new(vec![]),
        });
        let mut loader = RestoreLoader::new(backend.clone());

        let artifacts = vec![artifact(ArtifactRole::Data), artifact(ArtifactRole::Schema)];
        loader.load_all(&artifacts, None).await.unwrap();

        let loads = backend.loads.lock().unwrap();
        assert_eq!(loads.as_slice(), ["Schema", "Data"]);
    }

    #[tokio::test]
    async fn unordered_backend_accepts_any_sequence() {
        let backend = Arc::new(RecordingBackend {
            ordered: false,
            loads: Mutex::new(vec![]),
        });
        let mut loader = RestoreLoader::new(backend);
        loader
            .load(&artifact(ArtifactRole::Data), None)
            .await
            .unwrap();
    }

    #[test]
    fn locates_and_classifies_local_artifacts() {
        let root = TempDir::new().unwrap();
        let snap = root.path().join("snap1");
        std::fs::create_dir_all(snap.join("app")).unwrap();
        std::fs::write(snap.join("app/data.db"), b"x").unwrap();
        std::fs::write(snap.join("snap1_db_schema.sql"), b"CREATE").unwrap();
        std::fs::write(snap.join("snap1_db_data.sql"), b"INSERT").unwrap();

        let source = Destination::Local {
            path: root.path().to_path_buf(),
        };
        let artifacts = locate(&NoConnector, &source, None, Some("snap1")).unwrap();
        assert_eq!(artifacts.len(), 3);

        let roles: Vec<ArtifactRole> = artifacts.iter().map(|a| a.role).collect();
        assert!(roles.contains(&ArtifactRole::Schema));
        assert!(roles.contains(&ArtifactRole::Data));
        assert!(roles.contains(&ArtifactRole::Files));

        let dir = artifacts
            .iter()
            .find(|a| a.role == ArtifactRole::Files)
            .unwrap();
        assert_eq!(dir.unit.as_ref().unwrap().as_str(), "app");
        assert_eq!(dir.label, "snap1");
    }

    #[test]
    fn named_unit_selects_its_artifacts() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("snap1/app")).unwrap();
        std::fs::create_dir_all(root.path().join("snap1/other")).unwrap();

        let source = Destination::Local {
            path: root.path().to_path_buf(),
        };
        let unit = UnitName::new("app");
        let artifacts = locate(&NoConnector, &source, Some(&unit), Some("snap1")).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].unit.as_ref().unwrap().as_str(), "app");
    }

    #[test]
    fn missing_backup_is_artifact_not_found() {
        let root = TempDir::new().unwrap();
        let source = Destination::Local {
            path: root.path().to_path_buf(),
        };
        let err = locate(&NoConnector, &source, None, Some("nope")).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound(_)));
    }
}
