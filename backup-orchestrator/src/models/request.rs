//! Wire-level request types, tagged per backend.
//!
//! Destinations arrive loose (optional credential fields) so a missing remote
//! credential can be answered with 406 instead of a deserialization error;
//! `DestinationSpec::validate` produces the strict form the pipeline consumes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::AppError;
use crate::remote::RemoteHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    SearchIndex,
    ObjectStore,
    RelationalDb,
    WideColumnStore,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::SearchIndex => "search_index",
            BackendKind::ObjectStore => "object_store",
            BackendKind::RelationalDb => "relational_db",
            BackendKind::WideColumnStore => "wide_column_store",
        };
        f.write_str(name)
    }
}

/// Connection details for the store a job operates on. Each variant carries
/// only the fields meaningful to that backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendTarget {
    SearchIndex {
        url: String,
        #[serde(default)]
        repository: Option<String>,
    },
    ObjectStore {
        endpoint: String,
        access_key: String,
        secret_key: String,
        #[serde(default)]
        region: Option<String>,
    },
    RelationalDb {
        host: String,
        #[serde(default = "default_pg_port")]
        port: u16,
        user: String,
        password: String,
    },
    WideColumnStore {
        host: String,
        #[serde(default = "default_ssh_port")]
        ssh_port: u16,
        ssh_user: String,
        ssh_password: String,
    },
}

impl BackendTarget {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendTarget::SearchIndex { .. } => BackendKind::SearchIndex,
            BackendTarget::ObjectStore { .. } => BackendKind::ObjectStore,
            BackendTarget::RelationalDb { .. } => BackendKind::RelationalDb,
            BackendTarget::WideColumnStore { .. } => BackendKind::WideColumnStore,
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_ssh_port() -> u16 {
    22
}

/// Destination (or restore source) as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationSpec {
    Local {
        path: PathBuf,
    },
    Remote {
        host: Option<String>,
        #[serde(default = "default_ssh_port")]
        port: u16,
        user: Option<String>,
        password: Option<String>,
        path: Option<String>,
    },
}

/// Validated destination handed to the orchestrator.
#[derive(Debug, Clone)]
pub enum Destination {
    Local { path: PathBuf },
    Remote { host: RemoteHost, path: String },
}

impl DestinationSpec {
    pub fn validate(self) -> Result<Destination, AppError> {
        match self {
            DestinationSpec::Local { path } => Ok(Destination::Local { path }),
            DestinationSpec::Remote {
                host,
                port,
                user,
                password,
                path,
            } => match (host, user, password, path) {
                (Some(host), Some(user), Some(password), Some(path)) => Ok(Destination::Remote {
                    host: RemoteHost {
                        host,
                        port,
                        user,
                        password,
                    },
                    path,
                }),
                _ => Err(AppError::PreconditionFailed(
                    "remote credentials and backup path are required for a remote destination"
                        .into(),
                )),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    #[serde(flatten)]
    pub target: BackendTarget,
    #[serde(default)]
    pub unit: Option<String>,
    pub destination: DestinationSpec,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    #[serde(flatten)]
    pub target: BackendTarget,
    #[serde(default)]
    pub unit: Option<String>,
    pub source: DestinationSpec,
    #[serde(default)]
    pub label: Option<String>,
}

/// Body of the unit-listing and snapshot-listing endpoints.
#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    #[serde(flatten)]
    pub target: BackendTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_backend_target() {
        let req: BackupRequest = serde_json::from_str(
            r#"{
                "backend": "wide_column_store",
                "host": "10.0.0.9",
                "ssh_user": "scylla-admin",
                "ssh_password": "pw",
                "unit": "app",
                "destination": { "type": "local", "path": "/backups" }
            }"#,
        )
        .unwrap();
        assert_eq!(req.target.kind(), BackendKind::WideColumnStore);
        assert_eq!(req.unit.as_deref(), Some("app"));
        assert!(!req.overwrite);
    }

    #[test]
    fn remote_destination_requires_all_credentials() {
        let spec: DestinationSpec = serde_json::from_str(
            r#"{ "type": "remote", "host": "backup-host", "path": "/backups" }"#,
        )
        .unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn complete_remote_destination_validates() {
        let spec: DestinationSpec = serde_json::from_str(
            r#"{
                "type": "remote",
                "host": "backup-host",
                "user": "backup",
                "password": "pw",
                "path": "/backups"
            }"#,
        )
        .unwrap();
        match spec.validate().unwrap() {
            Destination::Remote { host, path } => {
                assert_eq!(host.host, "backup-host");
                assert_eq!(host.port, 22);
                assert_eq!(path, "/backups");
            }
            _ => panic!("expected remote destination"),
        }
    }
}
