//! Wide-column driver (ScyllaDB/Cassandra-compatible).
//!
//! Everything runs over SSH on the database host: `nodetool` for snapshots
//! and size statistics, `cqlsh` for truncation, and direct file placement
//! into the table data directory for restore. The engine refuses to read
//! files it does not own, so the service-account ownership fix during restore
//! is fatal on failure, unlike the other backends.

use async_trait::async_trait;
use std::sync::Arc;

use crate::backend::{
    validate_generic_name, Artifact, ArtifactLocation, ArtifactRole, Backend, SnapshotInfo,
    UnitName,
};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::models::request::BackendKind;
use crate::remote::{
    shell_quote, upload_tree, RemoteCommand, RemoteConnector, RemoteHost, RemoteShell,
};

pub(crate) const SYSTEM_KEYSPACES: &[&str] = &[
    "system",
    "system_schema",
    "system_auth",
    "system_distributed",
    "system_traces",
];

#[derive(Clone)]
pub struct WideColumnBackend {
    host: RemoteHost,
    connector: Arc<dyn RemoteConnector>,
    data_dir: String,
    service: String,
    owner: String,
}

impl WideColumnBackend {
    pub fn new(host: RemoteHost, connector: Arc<dyn RemoteConnector>, config: &AppConfig) -> Self {
        Self {
            host,
            connector,
            data_dir: config.wide_column_data_dir.clone(),
            service: config.wide_column_service.clone(),
            owner: config.wide_column_owner.clone(),
        }
    }

    fn shell(&self) -> Result<Arc<dyn RemoteShell>, PipelineError> {
        // The SSH endpoint *is* the backend here, so an unreachable host is a
        // backend connectivity failure.
        self.connector.connect(&self.host).map_err(|e| match e {
            PipelineError::RemoteUnreachable(m) => PipelineError::Connectivity(m),
            other => other,
        })
    }

    fn keyspaces(&self, shell: &dyn RemoteShell) -> Result<Vec<String>, PipelineError> {
        let entries = shell.read_dir(&self.data_dir)?;
        Ok(filter_visible_keyspaces(
            entries
                .into_iter()
                .filter(|e| e.is_dir)
                .map(|e| e.name)
                .collect(),
        ))
    }

    /// Snapshots known to the node, from `nodetool listsnapshots`.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, PipelineError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let shell = this.shell()?;
            let out = shell.exec(&RemoteCommand::new("nodetool").arg("listsnapshots"))?;
            if !out.success() {
                return Err(PipelineError::Connectivity(out.stderr.trim().to_string()));
            }
            Ok(parse_snapshot_listing(&out.stdout))
        })
        .await
        .map_err(join_err)?
    }

    /// Operator-triggered service restart after a restore. Restarting a live
    /// storage service is disruptive, so this is never part of the load flow.
    pub async fn restart_service(&self) -> Result<(), PipelineError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let shell = this.shell()?;
            tracing::info!(host = %this.host.host, service = %this.service, "Restarting storage service");
            let out = shell.exec(
                &RemoteCommand::new("systemctl")
                    .arg("restart")
                    .arg(&this.service)
                    .sudo(&this.host.password),
            )?;
            if !out.success() {
                return Err(PipelineError::RestoreFailed(format!(
                    "service restart failed: {}",
                    out.stderr.trim()
                )));
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}

#[async_trait]
impl Backend for WideColumnBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WideColumnStore
    }

    /// Accepts `keyspace` or `keyspace.table`.
    fn validate_unit(&self, name: &str) -> Result<(), PipelineError> {
        let (keyspace, table) = split_unit(name);
        validate_generic_name(&keyspace)?;
        if let Some(table) = table {
            validate_generic_name(&table)?;
        }
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let shell = this.shell()?;
            Ok(this
                .keyspaces(shell.as_ref())?
                .into_iter()
                .map(UnitName::new)
                .collect())
        })
        .await
        .map_err(join_err)?
    }

    async fn estimate_size(&self, unit: Option<&UnitName>) -> Result<u64, PipelineError> {
        let this = self.clone();
        let unit = unit.cloned();
        tokio::task::spawn_blocking(move || {
            let shell = this.shell()?;
            let targets = match unit {
                Some(u) => vec![u.as_str().to_string()],
                None => this.keyspaces(shell.as_ref())?,
            };
            let mut total = 0;
            for target in targets {
                let out = shell.exec(&RemoteCommand::new("nodetool").arg("cfstats").arg(&target))?;
                if !out.success() {
                    // An unknown or empty keyspace reports nothing; that is a
                    // zero estimate, not a failure.
                    continue;
                }
                total += parse_space_used(&out.stdout);
            }
            Ok(total)
        })
        .await
        .map_err(join_err)?
    }

    async fn snapshot(
        &self,
        unit: Option<&UnitName>,
        label: &str,
    ) -> Result<Vec<Artifact>, PipelineError> {
        let this = self.clone();
        let unit = unit.cloned();
        let label = label.to_string();
        tokio::task::spawn_blocking(move || {
            let shell = this.shell()?;
            let scopes = match &unit {
                Some(u) => vec![split_unit(u.as_str())],
                None => this
                    .keyspaces(shell.as_ref())?
                    .into_iter()
                    .map(|ks| (ks, None))
                    .collect(),
            };

            let mut artifacts = Vec::new();
            for (keyspace, table) in scopes {
                let mut cmd = RemoteCommand::new("nodetool")
                    .arg("snapshot")
                    .arg("-t")
                    .arg(&label);
                if let Some(table) = &table {
                    cmd = cmd.arg("--table").arg(table);
                }
                let out = shell.exec(&cmd.arg(&keyspace))?;
                if !out.success() {
                    let detail = if out.stderr.trim().is_empty() {
                        out.stdout
                    } else {
                        out.stderr
                    };
                    if detail.contains("already exists") {
                        return Err(PipelineError::DuplicateSnapshot(label));
                    }
                    return Err(PipelineError::SnapshotFailed(detail.trim().to_string()));
                }

                // The capture lands inside each table's data directory; find
                // the snapshot directories it produced.
                let find = RemoteCommand::new("find")
                    .arg(format!("{}/{}", this.data_dir, keyspace))
                    .arg("-type")
                    .arg("d")
                    .arg("-path")
                    .arg(format!("*/snapshots/{label}"));
                let out = shell.exec(&find)?;
                let dirs: Vec<&str> = out
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                if dirs.is_empty() {
                    return Err(PipelineError::ArtifactNotFound(format!(
                        "snapshot '{label}' reported success but no snapshot directory exists under {}/{keyspace}",
                        this.data_dir
                    )));
                }

                for dir in dirs {
                    let unit_name = table_unit_from_snapshot_path(&keyspace, dir)
                        .unwrap_or_else(|| keyspace.clone());
                    artifacts.push(Artifact {
                        unit: Some(UnitName::new(unit_name)),
                        location: ArtifactLocation::Remote {
                            host: this.host.clone(),
                            path: dir.to_string(),
                        },
                        role: ArtifactRole::Files,
                        label: label.clone(),
                    });
                }
            }
            Ok(artifacts)
        })
        .await
        .map_err(join_err)?
    }

    async fn restore(
        &self,
        artifact: &Artifact,
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError> {
        let unit_name = unit
            .or(artifact.unit.as_ref())
            .ok_or_else(|| {
                PipelineError::RestoreFailed("a keyspace.table unit is required for restore".into())
            })?
            .clone();
        self.validate_unit(unit_name.as_str())?;
        let (keyspace, table) = split_unit(unit_name.as_str());
        let Some(table) = table else {
            return Err(PipelineError::RestoreFailed(format!(
                "'{keyspace}' names a whole keyspace; restore targets one keyspace.table"
            )));
        };

        let ArtifactLocation::Local { path } = &artifact.location else {
            return Err(PipelineError::RestoreFailed(
                "artifact must be staged locally before placement".into(),
            ));
        };

        let this = self.clone();
        let local = path.clone();
        let label = if artifact.label.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            artifact.label.clone()
        };
        tokio::task::spawn_blocking(move || {
            let shell = this.shell()?;

            let keyspace_dir = format!("{}/{}", this.data_dir, keyspace);
            let table_prefix = format!("{table}-");
            let table_dir = shell
                .read_dir(&keyspace_dir)?
                .into_iter()
                .find(|e| e.is_dir && e.name.starts_with(&table_prefix))
                .ok_or_else(|| {
                    PipelineError::RestoreFailed(format!(
                        "no data directory for table '{keyspace}.{table}'"
                    ))
                })?;
            let dest = format!("{keyspace_dir}/{}", table_dir.name);

            // Truncate before placing files; reloading into a non-empty
            // table would duplicate rows.
            let out = shell.exec(
                &RemoteCommand::new("cqlsh")
                    .arg(&this.host.host)
                    .arg("-e")
                    .arg(format!("TRUNCATE {keyspace}.{table};")),
            )?;
            if !out.success() {
                return Err(PipelineError::RestoreFailed(format!(
                    "truncate of {keyspace}.{table} failed: {}",
                    out.stderr.trim()
                )));
            }

            // Two-hop placement: the live directory is owned by the service
            // account, so files go through a scratch path and get chowned
            // before the move.
            let scratch = format!("/tmp/wide_column_restore_{label}");
            shell.mkdir_p(&scratch)?;
            let uploaded = upload_tree(shell.as_ref(), &local, &scratch)?;
            tracing::info!(files = uploaded, scratch = %scratch, "Uploaded restore files to database host");

            let out = shell.exec(
                &RemoteCommand::new("chown")
                    .arg("-R")
                    .arg(format!("{0}:{0}", this.owner))
                    .arg(&scratch)
                    .sudo(&this.host.password),
            )?;
            if !out.success() {
                // Fatal: the engine will not read foreign-owned files.
                return Err(PipelineError::RestoreFailed(format!(
                    "ownership fix failed: {}",
                    out.stderr.trim()
                )));
            }

            let move_script = format!("mv {}/* {}/", shell_quote(&scratch), shell_quote(&dest));
            let out = shell.exec(
                &RemoteCommand::new("sh")
                    .arg("-c")
                    .arg(move_script)
                    .sudo(&this.host.password),
            )?;
            if !out.success() {
                return Err(PipelineError::RestoreFailed(format!(
                    "file placement into {dest} failed: {}",
                    out.stderr.trim()
                )));
            }

            let _ = shell.exec(
                &RemoteCommand::new("rm")
                    .arg("-rf")
                    .arg(&scratch)
                    .sudo(&this.host.password),
            );
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}

fn join_err(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Internal(format!("background task failed: {e}"))
}

pub(crate) fn filter_visible_keyspaces(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .filter(|n| !SYSTEM_KEYSPACES.contains(&n.as_str()))
        .collect()
}

/// Split `keyspace` or `keyspace.table` into its parts.
pub(crate) fn split_unit(name: &str) -> (String, Option<String>) {
    match name.split_once('.') {
        Some((ks, table)) => (ks.to_string(), Some(table.to_string())),
        None => (name.to_string(), None),
    }
}

/// Sum of `Space used (total):` figures in `nodetool cfstats` output.
pub(crate) fn parse_space_used(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("Space used (total):"))
        .filter_map(|v| v.trim().parse::<u64>().ok())
        .sum()
}

/// Derive `keyspace.table` from a snapshot directory path shaped like
/// `<data_dir>/<ks>/<table>-<uuid>/snapshots/<label>`.
pub(crate) fn table_unit_from_snapshot_path(keyspace: &str, path: &str) -> Option<String> {
    let parts: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    let n = parts.len();
    if n < 3 || parts[n - 2] != "snapshots" {
        return None;
    }
    let table = parts[n - 3].split('-').next()?;
    if table.is_empty() {
        None
    } else {
        Some(format!("{keyspace}.{table}"))
    }
}

/// Parse `nodetool listsnapshots` tabular output: name, keyspace, table,
/// then size figures.
pub(crate) fn parse_snapshot_listing(output: &str) -> Vec<SnapshotInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5
                || line.starts_with("Snapshot")
                || line.starts_with("Total")
            {
                return None;
            }
            Some(SnapshotInfo {
                name: parts[0].to_string(),
                unit: Some(format!("{}.{}", parts[1], parts[2])),
                size: Some(parts[parts.len() - 2..].join(" ")),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_keyspaces_are_filtered() {
        let names = vec![
            "app".to_string(),
            "system".to_string(),
            "system_auth".to_string(),
        ];
        assert_eq!(filter_visible_keyspaces(names), vec!["app"]);
    }

    #[test]
    fn splits_keyspace_and_table() {
        assert_eq!(split_unit("app"), ("app".to_string(), None));
        assert_eq!(
            split_unit("app.events"),
            ("app".to_string(), Some("events".to_string()))
        );
    }

    #[test]
    fn sums_space_used_lines() {
        let out = "\
Keyspace : app
\tTable: events
\t\tSpace used (live): 1024
\t\tSpace used (total): 2048
\tTable: users
\t\tSpace used (total): 4096
";
        assert_eq!(parse_space_used(out), 6144);
    }

    #[test]
    fn derives_table_unit_from_snapshot_path() {
        let path = "/var/lib/scylla/data/app/events-abc123def/snapshots/1700_snap";
        assert_eq!(
            table_unit_from_snapshot_path("app", path),
            Some("app.events".to_string())
        );
        assert_eq!(table_unit_from_snapshot_path("app", "/not/a/snapshot"), None);
    }

    #[test]
    fn parses_snapshot_listing_rows() {
        let out = "\
Snapshot Details:
Snapshot name Keyspace name Column family name True size Size on disk
1700_snap     app           events             10.5 KB   12 KB
1701_snap     app           users              1.2 MB    1.3 MB
Total TrueDiskSpaceUsed: 1.21 MB
";
        let snaps = parse_snapshot_listing(out);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "1700_snap");
        assert_eq!(snaps[0].unit.as_deref(), Some("app.events"));
        assert_eq!(snaps[0].size.as_deref(), Some("10.5 KB"));
    }
}
