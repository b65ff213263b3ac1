//! The top-level job state machine.
//!
//! Backup stages run in the fixed order Size, Capacity, Snapshot, Transfer;
//! restore runs Locate, Stage, Load. Each stage depends on the previous
//! stage's result, so they are sequential and blocking. Remote sessions are
//! owned by one job and dropped (closed) on every exit path.

pub mod capacity;
pub mod estimate;
pub mod format;
pub mod restore;
pub mod stager;
pub mod transfer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::backend::{Backend, UnitName};
use crate::error::PipelineError;
use crate::models::job::{BackupJob, JobStatus, RestoreJob};
use crate::models::request::Destination;
use crate::pipeline::restore::{RestoreLoader, RestorePhase};
use crate::pipeline::transfer::{TransferSession, TransferTarget};
use crate::remote::{RemoteConnector, RemoteShell};

#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub unit: Option<UnitName>,
    pub destination: Destination,
    pub label: Option<String>,
    pub overwrite: bool,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub unit: Option<UnitName>,
    pub source: Destination,
    pub label: Option<String>,
}

enum DestContext {
    Local {
        root: PathBuf,
        overwrite: bool,
    },
    Remote {
        shell: Arc<dyn RemoteShell>,
        root: String,
    },
}

pub struct Orchestrator {
    connector: Arc<dyn RemoteConnector>,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        staging_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            staging_dir,
            timeout,
        }
    }

    pub async fn run_backup(
        &self,
        backend: Arc<dyn Backend>,
        plan: BackupPlan,
    ) -> Result<BackupJob, PipelineError> {
        tokio::time::timeout(self.timeout, self.backup_inner(backend, plan))
            .await
            .map_err(|_| PipelineError::Timeout(self.timeout))?
    }

    pub async fn run_restore(
        &self,
        backend: Arc<dyn Backend>,
        plan: RestorePlan,
    ) -> Result<RestoreJob, PipelineError> {
        tokio::time::timeout(self.timeout, self.restore_inner(backend, plan))
            .await
            .map_err(|_| PipelineError::Timeout(self.timeout))?
    }

    async fn backup_inner(
        &self,
        backend: Arc<dyn Backend>,
        plan: BackupPlan,
    ) -> Result<BackupJob, PipelineError> {
        let job_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!(
            job_id = %job_id,
            backend = %backend.kind(),
            unit = plan.unit.as_ref().map(|u| u.as_str()).unwrap_or("<all>"),
            "Starting backup job"
        );

        let estimate = estimate::estimate(backend.as_ref(), plan.unit.as_ref()).await?;
        tracing::info!(job_id = %job_id, total = %estimate.total, "Estimated backup size");

        // Capacity gate. Must pass before anything is snapshotted or moved;
        // local destinations perform no check.
        let (ctx, capacity_check) = match &plan.destination {
            Destination::Remote { host, path } => {
                let connector = self.connector.clone();
                let host = host.clone();
                let path = path.clone();
                let required = estimate.total_bytes;
                let (shell, check) = tokio::task::spawn_blocking(move || {
                    let shell = connector.connect(&host)?;
                    let check = capacity::check_remote(shell.as_ref(), &path, required)?;
                    Ok::<_, PipelineError>((shell, check))
                })
                .await
                .map_err(join_err)??;
                check.ensure_sufficient()?;
                (
                    DestContext::Remote {
                        shell,
                        root: path_string(&plan.destination),
                    },
                    Some(check),
                )
            }
            Destination::Local { path } => (
                DestContext::Local {
                    root: path.clone(),
                    overwrite: plan.overwrite,
                },
                None,
            ),
        };

        let (label, artifacts) =
            stager::stage(backend.as_ref(), plan.unit.as_ref(), plan.label.clone()).await?;
        tracing::info!(job_id = %job_id, label = %label, artifacts = artifacts.len(), "Snapshot staged");

        let manifest = {
            let connector = self.connector.clone();
            let staging = self.staging_dir.clone();
            let artifacts = artifacts.clone();
            let label = label.clone();
            tokio::task::spawn_blocking(move || {
                let session = TransferSession::new(connector.as_ref(), &staging);
                let target = match &ctx {
                    DestContext::Local { root, overwrite } => TransferTarget::Local {
                        root,
                        overwrite: *overwrite,
                    },
                    DestContext::Remote { shell, root } => TransferTarget::Remote {
                        shell: shell.as_ref(),
                        root,
                    },
                };
                session.run(&artifacts, &label, &target)
            })
            .await
            .map_err(join_err)??
        };

        tracing::info!(
            job_id = %job_id,
            transferred = manifest.transferred(),
            skipped = manifest.skipped(),
            "Backup job completed"
        );

        Ok(BackupJob {
            id: job_id,
            backend: backend.kind(),
            unit: plan.unit.map(|u| u.to_string()),
            label,
            status: JobStatus::Succeeded,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            estimate,
            capacity: capacity_check,
            artifact_paths: artifacts.iter().map(|a| a.describe()).collect(),
            files_transferred: manifest.transferred(),
            files_skipped: manifest.skipped(),
        })
    }

    async fn restore_inner(
        &self,
        backend: Arc<dyn Backend>,
        plan: RestorePlan,
    ) -> Result<RestoreJob, PipelineError> {
        let job_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!(
            job_id = %job_id,
            backend = %backend.kind(),
            unit = plan.unit.as_ref().map(|u| u.as_str()).unwrap_or("<all>"),
            "Starting restore job"
        );

        let located = {
            let connector = self.connector.clone();
            let source = plan.source.clone();
            let unit = plan.unit.clone();
            let label = plan.label.clone();
            tokio::task::spawn_blocking(move || {
                restore::locate(connector.as_ref(), &source, unit.as_ref(), label.as_deref())
            })
            .await
            .map_err(join_err)??
        };
        tracing::info!(
            job_id = %job_id,
            phase = ?RestorePhase::Located,
            artifacts = located.len(),
            "Located restore artifacts"
        );

        let artifact_paths: Vec<String> = located.iter().map(|a| a.describe()).collect();

        let staged = {
            let connector = self.connector.clone();
            let staging = self.staging_dir.clone();
            let jid = job_id.clone();
            let located = located.clone();
            tokio::task::spawn_blocking(move || {
                restore::stage(connector.as_ref(), &staging, &jid, located)
            })
            .await
            .map_err(join_err)??
        };
        tracing::info!(job_id = %job_id, phase = ?RestorePhase::Staged, "Artifacts staged");

        let mut loader = RestoreLoader::new(backend.clone());
        loader.load_all(&staged, plan.unit.as_ref()).await?;

        tracing::info!(job_id = %job_id, phase = ?RestorePhase::Loaded, "Restore job completed");

        Ok(RestoreJob {
            id: job_id,
            backend: backend.kind(),
            unit: plan.unit.map(|u| u.to_string()),
            label: plan.label,
            status: JobStatus::Succeeded,
            phase: RestorePhase::Loaded,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            artifact_paths,
        })
    }
}

fn path_string(dest: &Destination) -> String {
    match dest {
        Destination::Local { path } => path.display().to_string(),
        Destination::Remote { path, .. } => path.clone(),
    }
}

fn join_err(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Internal(format!("background task failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Artifact, ArtifactLocation, ArtifactRole};
    use crate::models::request::BackendKind;
    use crate::remote::{ExecOutput, RemoteCommand, RemoteEntry, RemoteHost};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeShell {
        df_output: String,
        uploads: Mutex<Vec<String>>,
        dirs: Mutex<HashSet<String>>,
    }

    impl FakeShell {
        fn with_available(avail: &str) -> Self {
            Self {
                df_output: format!(
                    "Filesystem      Size  Used Avail Use% Mounted on\n\
                     /dev/sda1       100G   50G {avail}  50% /backups\n"
                ),
                uploads: Mutex::new(vec![]),
                dirs: Mutex::new(HashSet::new()),
            }
        }
    }

    impl RemoteShell for FakeShell {
        fn exec(&self, cmd: &RemoteCommand) -> Result<ExecOutput, PipelineError> {
            let rendered = cmd.render();
            let stdout = if rendered.starts_with("df ") {
                self.df_output.clone()
            } else {
                String::new()
            };
            Ok(ExecOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            })
        }

        fn upload(&self, _local: &Path, remote: &str) -> Result<(), PipelineError> {
            self.uploads.lock().unwrap().push(remote.to_string());
            Ok(())
        }

        fn download(&self, remote: &str, _local: &Path) -> Result<(), PipelineError> {
            Err(PipelineError::Internal(format!(
                "unexpected download of {remote}"
            )))
        }

        fn mkdir_p(&self, remote: &str) -> Result<(), PipelineError> {
            self.dirs.lock().unwrap().insert(remote.to_string());
            Ok(())
        }

        fn read_dir(&self, _remote: &str) -> Result<Vec<RemoteEntry>, PipelineError> {
            Ok(vec![])
        }

        fn is_dir(&self, _remote: &str) -> Result<bool, PipelineError> {
            Ok(true)
        }

        fn exists(&self, _remote: &str) -> Result<bool, PipelineError> {
            Ok(true)
        }
    }

    struct FakeConnector {
        shell: Arc<FakeShell>,
    }

    impl RemoteConnector for FakeConnector {
        fn connect(&self, _host: &RemoteHost) -> Result<Arc<dyn RemoteShell>, PipelineError> {
            Ok(self.shell.clone())
        }
    }

    struct UnreachableConnector;

    impl RemoteConnector for UnreachableConnector {
        fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn RemoteShell>, PipelineError> {
            Err(PipelineError::RemoteUnreachable(host.host.clone()))
        }
    }

    struct FakeBackend {
        units: Vec<(String, u64)>,
        artifact_dir: PathBuf,
        labels: Mutex<HashSet<String>>,
        snapshots_taken: Mutex<usize>,
    }

    impl FakeBackend {
        fn new(units: &[(&str, u64)], artifact_dir: &Path) -> Self {
            Self {
                units: units
                    .iter()
                    .map(|(n, s)| (n.to_string(), *s))
                    .collect(),
                artifact_dir: artifact_dir.to_path_buf(),
                labels: Mutex::new(HashSet::new()),
                snapshots_taken: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ObjectStore
        }

        async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
            Ok(self.units.iter().map(|(n, _)| UnitName::new(n)).collect())
        }

        async fn estimate_size(&self, unit: Option<&UnitName>) -> Result<u64, PipelineError> {
            match unit {
                Some(u) => Ok(self
                    .units
                    .iter()
                    .find(|(n, _)| n == u.as_str())
                    .map(|(_, s)| *s)
                    .unwrap_or(0)),
                None => Ok(self.units.iter().map(|(_, s)| s).sum()),
            }
        }

        async fn snapshot(
            &self,
            unit: Option<&UnitName>,
            label: &str,
        ) -> Result<Vec<Artifact>, PipelineError> {
            if !self.labels.lock().unwrap().insert(label.to_string()) {
                return Err(PipelineError::DuplicateSnapshot(label.to_string()));
            }
            *self.snapshots_taken.lock().unwrap() += 1;
            Ok(vec![Artifact {
                unit: unit.cloned(),
                location: ArtifactLocation::Local {
                    path: self.artifact_dir.clone(),
                },
                role: ArtifactRole::Files,
                label: label.to_string(),
            }])
        }

        async fn restore(
            &self,
            _artifact: &Artifact,
            _unit: Option<&UnitName>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn remote_destination() -> Destination {
        Destination::Remote {
            host: RemoteHost {
                host: "h".into(),
                port: 22,
                user: "backup".into(),
                password: "pw".into(),
            },
            path: "/backups".into(),
        }
    }

    fn artifact_fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("part-0.dat"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("part-1.dat"), b"9876543210").unwrap();
        dir
    }

    const GB: u64 = 1024 * 1024 * 1024;

    #[tokio::test]
    async fn insufficient_space_fails_before_snapshot_and_transfer() {
        let artifacts = artifact_fixture();
        let backend = Arc::new(FakeBackend::new(
            &[("b1", 2 * GB), ("b2", 2 * GB), ("b3", GB)],
            artifacts.path(),
        ));
        let shell = Arc::new(FakeShell::with_available("2.0G"));
        let staging = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(FakeConnector {
                shell: shell.clone(),
            }),
            staging.path().to_path_buf(),
            Duration::from_secs(5),
        );

        let err = orchestrator
            .run_backup(
                backend.clone(),
                BackupPlan {
                    unit: None,
                    destination: remote_destination(),
                    label: None,
                    overwrite: false,
                },
            )
            .await
            .unwrap_err();

        match err {
            PipelineError::InsufficientSpace {
                required,
                available,
            } => {
                assert_eq!(required, "5.00 GB");
                assert_eq!(available, "2.00 GB");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Fail fast: nothing snapshotted, nothing moved.
        assert_eq!(*backend.snapshots_taken.lock().unwrap(), 0);
        assert!(shell.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_backup_uploads_every_manifest_entry() {
        let artifacts = artifact_fixture();
        let backend = Arc::new(FakeBackend::new(&[("b1", GB)], artifacts.path()));
        let shell = Arc::new(FakeShell::with_available("100G"));
        let staging = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(FakeConnector {
                shell: shell.clone(),
            }),
            staging.path().to_path_buf(),
            Duration::from_secs(5),
        );

        let job = orchestrator
            .run_backup(
                backend,
                BackupPlan {
                    unit: Some(UnitName::new("b1")),
                    destination: remote_destination(),
                    label: Some("snap_x".into()),
                    overwrite: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.files_transferred, 2);
        assert!(job.capacity.is_some());

        let uploads = shell.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|u| u.starts_with("/backups/snap_x/b1/")));
    }

    #[tokio::test]
    async fn local_destination_skips_capacity_check() {
        let artifacts = artifact_fixture();
        let backend = Arc::new(FakeBackend::new(&[("b1", GB)], artifacts.path()));
        let dest = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        // A connector that cannot reach anything: proves no session is opened
        // for a local destination.
        let orchestrator = Orchestrator::new(
            Arc::new(UnreachableConnector),
            staging.path().to_path_buf(),
            Duration::from_secs(5),
        );

        let job = orchestrator
            .run_backup(
                backend,
                BackupPlan {
                    unit: None,
                    destination: Destination::Local {
                        path: dest.path().to_path_buf(),
                    },
                    label: Some("snap_local".into()),
                    overwrite: false,
                },
            )
            .await
            .unwrap();

        assert!(job.capacity.is_none());
        assert_eq!(job.files_transferred, 2);
        assert!(dest.path().join("snap_local").is_dir());
    }

    #[tokio::test]
    async fn repeated_label_is_a_duplicate_snapshot() {
        let artifacts = artifact_fixture();
        let backend = Arc::new(FakeBackend::new(&[("b1", GB)], artifacts.path()));
        let dest = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(UnreachableConnector),
            staging.path().to_path_buf(),
            Duration::from_secs(5),
        );

        let plan = BackupPlan {
            unit: None,
            destination: Destination::Local {
                path: dest.path().to_path_buf(),
            },
            label: Some("x".into()),
            overwrite: false,
        };

        orchestrator
            .run_backup(backend.clone(), plan.clone())
            .await
            .unwrap();
        let err = orchestrator.run_backup(backend, plan).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateSnapshot(l) if l == "x"));
    }

    struct SlowBackend;

    #[async_trait]
    impl Backend for SlowBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ObjectStore
        }

        async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }

        async fn estimate_size(&self, _unit: Option<&UnitName>) -> Result<u64, PipelineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
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
            _artifact: &Artifact,
            _unit: Option<&UnitName>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stuck_job_times_out() {
        let dest = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let timeout = Duration::from_millis(50);
        let orchestrator = Orchestrator::new(
            Arc::new(UnreachableConnector),
            staging.path().to_path_buf(),
            timeout,
        );

        let err = orchestrator
            .run_backup(
                Arc::new(SlowBackend),
                BackupPlan {
                    unit: None,
                    destination: Destination::Local {
                        path: dest.path().to_path_buf(),
                    },
                    label: None,
                    overwrite: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(t) if t == timeout));
    }

    #[tokio::test]
    async fn restore_runs_locate_stage_load() {
        let backup_root = TempDir::new().unwrap();
        std::fs::create_dir_all(backup_root.path().join("snap1/b1")).unwrap();
        std::fs::write(backup_root.path().join("snap1/b1/part-0.dat"), b"x").unwrap();

        let artifacts = artifact_fixture();
        let backend = Arc::new(FakeBackend::new(&[("b1", GB)], artifacts.path()));
        let staging = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(UnreachableConnector),
            staging.path().to_path_buf(),
            Duration::from_secs(5),
        );

        let job = orchestrator
            .run_restore(
                backend,
                RestorePlan {
                    unit: Some(UnitName::new("b1")),
                    source: Destination::Local {
                        path: backup_root.path().to_path_buf(),
                    },
                    label: Some("snap1".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.phase, RestorePhase::Loaded);
        assert_eq!(job.artifact_paths.len(), 1);
    }
}
