//! Artifact movement from the source host to the backup destination.
//!
//! Artifacts that live on a backend host (reachable only over SSH) are pulled
//! through the local staging area first, then pushed on to the destination;
//! the destination host never needs credentials for the backend host.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use walkdir::WalkDir;

use crate::backend::{Artifact, ArtifactLocation};
use crate::error::PipelineError;
use crate::remote::{download_tree, RemoteConnector, RemoteShell};

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub source: String,
    pub dest: String,
    pub done: bool,
    pub skipped: bool,
}

/// Ordered file-transfer plan for one job. Consulted on completion to report
/// partial success; the pending subset is what a caller would retry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferManifest {
    pub entries: Vec<ManifestEntry>,
}

impl TransferManifest {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn completed(&self) -> usize {
        self.entries.iter().filter(|e| e.done).count()
    }

    pub fn transferred(&self) -> usize {
        self.entries.iter().filter(|e| e.done && !e.skipped).count()
    }

    pub fn skipped(&self) -> usize {
        self.entries.iter().filter(|e| e.skipped).count()
    }

    pub fn pending(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.done)
            .map(|e| e.dest.clone())
            .collect()
    }
}

/// Where a transfer lands. The remote shell is the job-owned session that
/// already passed the capacity check.
pub enum TransferTarget<'a> {
    Local { root: &'a Path, overwrite: bool },
    Remote { shell: &'a dyn RemoteShell, root: &'a str },
}

struct PlannedFile {
    local: PathBuf,
    dest_rel: String,
    source_display: String,
}

pub struct TransferSession<'a> {
    connector: &'a dyn RemoteConnector,
    staging_dir: &'a Path,
}

impl<'a> TransferSession<'a> {
    pub fn new(connector: &'a dyn RemoteConnector, staging_dir: &'a Path) -> Self {
        Self {
            connector,
            staging_dir,
        }
    }

    /// Move every artifact under `<destination root>/<label>/`, preserving
    /// relative structure under each artifact's unit name.
    ///
    /// A failure partway through yields `PartialTransfer` listing the entries
    /// still pending; a failure before anything copied propagates as-is.
    pub fn run(
        &self,
        artifacts: &[Artifact],
        label: &str,
        target: &TransferTarget<'_>,
    ) -> Result<TransferManifest, PipelineError> {
        let localized = self.localize(artifacts, label)?;
        let files = plan_files(&localized)?;

        let mut manifest = TransferManifest {
            entries: files
                .iter()
                .map(|f| ManifestEntry {
                    source: f.source_display.clone(),
                    dest: format!("{label}/{}", f.dest_rel),
                    done: false,
                    skipped: false,
                })
                .collect(),
        };

        match target {
            TransferTarget::Local { root, overwrite } => {
                let job_root = root.join(label);
                for (idx, file) in files.iter().enumerate() {
                    let dest = job_root.join(&file.dest_rel);
                    if dest.exists() && !overwrite {
                        manifest.entries[idx].done = true;
                        manifest.entries[idx].skipped = true;
                        continue;
                    }
                    let copied = (|| -> Result<(), PipelineError> {
                        if let Some(parent) = dest.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::copy(&file.local, &dest)?;
                        Ok(())
                    })();
                    match copied {
                        Ok(()) => manifest.entries[idx].done = true,
                        Err(e) => return Err(partial_or(&manifest, e)),
                    }
                }
            }
            TransferTarget::Remote { shell, root } => {
                let job_root = format!("{}/{}", root.trim_end_matches('/'), label);
                shell.mkdir_p(&job_root)?;
                let mut made_dirs: HashSet<String> = HashSet::new();
                for (idx, file) in files.iter().enumerate() {
                    let dest = format!("{job_root}/{}", file.dest_rel);
                    let uploaded = (|| -> Result<(), PipelineError> {
                        if let Some(slash) = dest.rfind('/') {
                            let parent = dest[..slash].to_string();
                            if made_dirs.insert(parent.clone()) {
                                shell.mkdir_p(&parent)?;
                            }
                        }
                        shell.upload(&file.local, &dest)
                    })();
                    match uploaded {
                        Ok(()) => manifest.entries[idx].done = true,
                        Err(e) => return Err(partial_or(&manifest, e)),
                    }
                }
            }
        }

        Ok(manifest)
    }

    /// Pull remote-source artifacts into the staging area so the push leg
    /// only ever reads local files. Local artifacts pass through untouched.
    fn localize(
        &self,
        artifacts: &[Artifact],
        label: &str,
    ) -> Result<Vec<(Artifact, PathBuf, String)>, PipelineError> {
        let mut shells: HashMap<String, Arc<dyn RemoteShell>> = HashMap::new();
        let mut out = Vec::with_capacity(artifacts.len());

        for (idx, artifact) in artifacts.iter().enumerate() {
            match &artifact.location {
                ArtifactLocation::Local { path } => {
                    out.push((artifact.clone(), path.clone(), artifact.describe()));
                }
                ArtifactLocation::Remote { host, path } => {
                    let key = format!("{}@{}:{}", host.user, host.host, host.port);
                    let shell = match shells.get(&key) {
                        Some(s) => s.clone(),
                        None => {
                            let s = self.connector.connect(host)?;
                            shells.insert(key, s.clone());
                            s
                        }
                    };
                    let local = self
                        .staging_dir
                        .join("incoming")
                        .join(label)
                        .join(idx.to_string());
                    download_tree(shell.as_ref(), path, &local)?;
                    out.push((artifact.clone(), local, artifact.describe()));
                }
            }
        }
        Ok(out)
    }
}

/// Expand each artifact into its file list with destination-relative paths.
fn plan_files(
    localized: &[(Artifact, PathBuf, String)],
) -> Result<Vec<PlannedFile>, PipelineError> {
    let mut files = Vec::new();
    for (artifact, local, source_display) in localized {
        let prefix = artifact.unit.as_ref().map(|u| u.as_str().to_string());

        if local.is_file() {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    PipelineError::Internal(format!("artifact has no file name: {source_display}"))
                })?;
            let dest_rel = match &prefix {
                Some(p) => format!("{p}/{name}"),
                None => name,
            };
            files.push(PlannedFile {
                local: local.clone(),
                dest_rel,
                source_display: source_display.clone(),
            });
            continue;
        }

        let base = prefix.unwrap_or_else(|| {
            local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "artifact".to_string())
        });
        for entry in WalkDir::new(local) {
            let entry = entry.map_err(|e| PipelineError::Internal(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(local)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push(PlannedFile {
                local: entry.path().to_path_buf(),
                dest_rel: format!("{base}/{relative}"),
                source_display: format!("{source_display}/{relative}"),
            });
        }
    }
    Ok(files)
}

fn partial_or(manifest: &TransferManifest, underlying: PipelineError) -> PipelineError {
    let completed = manifest.completed();
    if completed == 0 {
        return underlying;
    }
    tracing::warn!(
        completed,
        total = manifest.total(),
        "transfer interrupted: {underlying}"
    );
    PipelineError::PartialTransfer {
        completed,
        total: manifest.total(),
        pending: manifest.pending(),
    }
}
