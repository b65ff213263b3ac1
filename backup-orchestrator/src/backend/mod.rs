//! The capability interface the orchestrator consumes from each store driver.

pub mod object_store;
pub mod relational;
pub mod search_index;
pub mod wide_column;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::models::request::{BackendKind, BackendTarget};
use crate::remote::{RemoteConnector, RemoteHost};

/// Name of one backupable unit: an index, bucket, database or keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitName(String);

impl UnitName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default unit-name rule: letters, digits and underscores only.
pub fn validate_generic_name(name: &str) -> Result<(), PipelineError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(PipelineError::InvalidName(format!(
            "'{name}' must contain only letters, digits and underscores"
        )));
    }
    Ok(())
}

/// What one artifact contains. Schema artifacts must load before data
/// artifacts on backends with schema/data separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    Schema,
    Files,
    Data,
}

/// Where an artifact lives: on this host, or on the backend's host reachable
/// over SSH.
#[derive(Debug, Clone)]
pub enum ArtifactLocation {
    Local { path: PathBuf },
    Remote { host: RemoteHost, path: String },
}

/// Handle to the on-disk output of one native snapshot/dump. Immutable once
/// staged.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub unit: Option<UnitName>,
    pub location: ArtifactLocation,
    pub role: ArtifactRole,
    pub label: String,
}

impl Artifact {
    /// Display path for job reports; never includes credentials.
    pub fn describe(&self) -> String {
        match &self.location {
            ArtifactLocation::Local { path } => path.display().to_string(),
            ArtifactLocation::Remote { host, path } => format!("{}:{}", host.host, path),
        }
    }
}

/// One snapshot known to a backend that can enumerate them.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Contract every store driver implements for the orchestrator.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// True when data artifacts reference schema objects and must load after
    /// the schema artifact.
    fn schema_before_data(&self) -> bool {
        false
    }

    /// Unit-name syntax check, run before any storage access or remote
    /// command is built.
    fn validate_unit(&self, name: &str) -> Result<(), PipelineError> {
        validate_generic_name(name)
    }

    /// Backupable units with the backend's system units filtered out.
    async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError>;

    /// Size in bytes of one unit, or the sum across all listed units.
    /// Returns 0 for an empty unit rather than failing.
    async fn estimate_size(&self, unit: Option<&UnitName>) -> Result<u64, PipelineError>;

    /// Trigger the native point-in-time capture. A label that was already
    /// used fails with `DuplicateSnapshot` instead of overwriting.
    async fn snapshot(
        &self,
        unit: Option<&UnitName>,
        label: &str,
    ) -> Result<Vec<Artifact>, PipelineError>;

    /// Reload one artifact into the store.
    async fn restore(
        &self,
        artifact: &Artifact,
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError>;
}

/// Build the driver for a request target. Drivers own their native clients;
/// the orchestrator only sees the trait.
pub fn build(
    target: BackendTarget,
    config: &AppConfig,
    connector: Arc<dyn RemoteConnector>,
) -> Arc<dyn Backend> {
    match target {
        BackendTarget::SearchIndex { url, repository } => Arc::new(
            search_index::SearchIndexBackend::new(url, repository, config),
        ),
        BackendTarget::ObjectStore {
            endpoint,
            access_key,
            secret_key,
            region,
        } => Arc::new(object_store::ObjectStoreBackend::new(
            &endpoint,
            &access_key,
            &secret_key,
            region.as_deref(),
            config.staging_dir.clone(),
        )),
        BackendTarget::RelationalDb {
            host,
            port,
            user,
            password,
        } => Arc::new(relational::RelationalBackend::new(
            host,
            port,
            user,
            password,
            config.staging_dir.clone(),
        )),
        BackendTarget::WideColumnStore {
            host,
            ssh_port,
            ssh_user,
            ssh_password,
        } => Arc::new(wide_column::WideColumnBackend::new(
            RemoteHost {
                host,
                port: ssh_port,
                user: ssh_user,
                password: ssh_password,
            },
            connector,
            config,
        )),
    }
}
