//! Relational driver (PostgreSQL): schema and data dumps via
//! `pg_dumpall`/`pg_dump`, reload via `psql`.
//!
//! The dump is split into a schema artifact and a data artifact because data
//! statements reference schema objects; the restore loader loads schema
//! first. Role statements for the superuser are stripped while writing so a
//! reload never tries to recreate it. The database password is passed only
//! into the spawned child's environment.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::backend::{
    validate_generic_name, Artifact, ArtifactLocation, ArtifactRole, Backend, UnitName,
};
use crate::error::PipelineError;
use crate::models::request::BackendKind;

pub(crate) const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

pub struct RelationalBackend {
    host: String,
    port: u16,
    user: String,
    password: String,
    staging_dir: PathBuf,
}

impl RelationalBackend {
    pub fn new(
        host: String,
        port: u16,
        user: String,
        password: String,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            host,
            port,
            user,
            password,
            staging_dir,
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-U")
            .arg(&self.user)
            .arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string())
            .env("PGPASSWORD", &self.password)
            .stdin(Stdio::null());
        cmd
    }

    async fn query(&self, sql: &str) -> Result<String, PipelineError> {
        let out = self
            .command("psql")
            .arg("-d")
            .arg("postgres")
            .arg("-tA")
            .arg("-c")
            .arg(sql)
            .output()
            .await
            .map_err(spawn_err)?;
        if !out.status.success() {
            return Err(PipelineError::Connectivity(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    async fn dump_to_file(
        &self,
        mut cmd: Command,
        path: &PathBuf,
    ) -> Result<(), PipelineError> {
        let out = cmd.output().await.map_err(spawn_err)?;
        if !out.status.success() {
            return Err(PipelineError::SnapshotFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        let filtered = strip_role_statements(&String::from_utf8_lossy(&out.stdout));
        tokio::fs::write(path, filtered).await?;
        Ok(())
    }

    async fn ensure_database(&self, name: &str) -> Result<(), PipelineError> {
        validate_generic_name(name)?;
        let exists = self
            .query(&format!(
                "SELECT 1 FROM pg_database WHERE datname = '{name}'"
            ))
            .await?;
        if !exists.trim().is_empty() {
            return Ok(());
        }
        tracing::info!(database = name, "Creating missing database before restore");
        let out = self
            .command("psql")
            .arg("-d")
            .arg("postgres")
            .arg("-c")
            .arg(format!("CREATE DATABASE \"{name}\";"))
            .output()
            .await
            .map_err(spawn_err)?;
        if !out.status.success() {
            return Err(PipelineError::RestoreFailed(format!(
                "could not create database '{name}': {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn load_file(&self, database: &str, path: &PathBuf) -> Result<(), PipelineError> {
        let out = self
            .command("psql")
            .arg("-d")
            .arg(database)
            .arg("-f")
            .arg(path)
            .output()
            .await
            .map_err(spawn_err)?;
        if !out.status.success() {
            return Err(PipelineError::RestoreFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RelationalDb
    }

    fn schema_before_data(&self) -> bool {
        true
    }

    async fn list_units(&self) -> Result<Vec<UnitName>, PipelineError> {
        let out = self
            .query("SELECT datname FROM pg_database WHERE NOT datistemplate")
            .await?;
        let names = out.lines().map(str::to_string).collect();
        Ok(filter_system_databases(names)
            .into_iter()
            .map(UnitName::new)
            .collect())
    }

    async fn estimate_size(&self, unit: Option<&UnitName>) -> Result<u64, PipelineError> {
        let sql = match unit {
            Some(u) => {
                self.validate_unit(u.as_str())?;
                format!("SELECT pg_database_size('{u}')")
            }
            None => "SELECT COALESCE(SUM(pg_database_size(datname)), 0) \
                     FROM pg_database WHERE NOT datistemplate"
                .to_string(),
        };
        let out = self.query(&sql).await?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    async fn snapshot(
        &self,
        unit: Option<&UnitName>,
        label: &str,
    ) -> Result<Vec<Artifact>, PipelineError> {
        let dump_dir = self.staging_dir.join("relational");
        tokio::fs::create_dir_all(&dump_dir).await?;

        let schema_path = dump_dir.join(format!("{label}_{}_schema.sql", self.host));
        let data_path = dump_dir.join(format!("{label}_{}_data.sql", self.host));
        if schema_path.exists() || data_path.exists() {
            return Err(PipelineError::DuplicateSnapshot(label.to_string()));
        }

        match unit {
            Some(u) => {
                self.validate_unit(u.as_str())?;
                let mut schema = self.command("pg_dump");
                schema.arg("-d").arg(u.as_str()).arg("--schema-only");
                self.dump_to_file(schema, &schema_path).await?;

                let mut data = self.command("pg_dump");
                data.arg("-d").arg(u.as_str()).arg("--data-only");
                self.dump_to_file(data, &data_path).await?;
            }
            None => {
                let mut schema = self.command("pg_dumpall");
                schema.arg("--schema-only");
                self.dump_to_file(schema, &schema_path).await?;

                let data = self.command("pg_dumpall");
                self.dump_to_file(data, &data_path).await?;
            }
        }

        Ok(vec![
            Artifact {
                unit: unit.cloned(),
                location: ArtifactLocation::Local { path: schema_path },
                role: ArtifactRole::Schema,
                label: label.to_string(),
            },
            Artifact {
                unit: unit.cloned(),
                location: ArtifactLocation::Local { path: data_path },
                role: ArtifactRole::Data,
                label: label.to_string(),
            },
        ])
    }

    async fn restore(
        &self,
        artifact: &Artifact,
        unit: Option<&UnitName>,
    ) -> Result<(), PipelineError> {
        if let Some(u) = unit {
            self.validate_unit(u.as_str())?;
        }
        let ArtifactLocation::Local { path } = &artifact.location else {
            return Err(PipelineError::RestoreFailed(
                "artifact must be staged locally before reload".into(),
            ));
        };

        match artifact.role {
            ArtifactRole::Schema => {
                let content = tokio::fs::read_to_string(path).await?;
                for db in extract_database_names(&content) {
                    self.ensure_database(&db).await?;
                }
                let database = unit.map(|u| u.as_str().to_string());
                self.load_file(database.as_deref().unwrap_or("postgres"), path)
                    .await
            }
            ArtifactRole::Data => {
                let database = unit.map(|u| u.as_str().to_string());
                self.load_file(database.as_deref().unwrap_or("postgres"), path)
                    .await
            }
            ArtifactRole::Files => Err(PipelineError::RestoreFailed(
                "file-tree artifacts cannot be loaded into a relational store".into(),
            )),
        }
    }
}

fn spawn_err(e: std::io::Error) -> PipelineError {
    PipelineError::Connectivity(format!("could not run client tool: {e}"))
}

/// Drop superuser role statements while writing a dump; a reload must never
/// recreate or alter the superuser.
pub(crate) fn strip_role_statements(dump: &str) -> String {
    let mut out = String::with_capacity(dump.len());
    for line in dump.lines() {
        if line.contains("CREATE ROLE postgres") || line.contains("ALTER ROLE postgres") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Database names referenced by `CREATE DATABASE` statements in a schema
/// dump. Names that fail the unit-name rule are skipped rather than quoted
/// into later commands.
pub(crate) fn extract_database_names(schema_sql: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in schema_sql.lines() {
        let Some(rest) = line.trim_start().strip_prefix("CREATE DATABASE ") else {
            continue;
        };
        let token = rest.split_whitespace().next().unwrap_or("");
        let name = token.trim_matches('"').trim_end_matches(';');
        if name.is_empty()
            || validate_generic_name(name).is_err()
            || names.iter().any(|n| n == name)
        {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

pub(crate) fn filter_system_databases(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && !SYSTEM_DATABASES.contains(&n.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_superuser_role_statements() {
        let dump = "\
CREATE ROLE app;
CREATE ROLE postgres;
ALTER ROLE postgres WITH SUPERUSER;
CREATE DATABASE appdb WITH TEMPLATE = template0;
";
        let filtered = strip_role_statements(dump);
        assert!(filtered.contains("CREATE ROLE app;"));
        assert!(filtered.contains("CREATE DATABASE appdb"));
        assert!(!filtered.contains("postgres"));
    }

    #[test]
    fn extracts_quoted_and_bare_database_names() {
        let dump = "\
CREATE DATABASE appdb WITH TEMPLATE = template0 ENCODING = 'UTF8';
CREATE DATABASE \"audit_log\" WITH TEMPLATE = template0;
CREATE DATABASE appdb WITH TEMPLATE = template0;
CREATE DATABASE \"bad-name\" WITH TEMPLATE = template0;
";
        assert_eq!(extract_database_names(dump), vec!["appdb", "audit_log"]);
    }

    #[test]
    fn system_databases_are_never_listed() {
        let names = vec![
            "appdb".to_string(),
            "postgres".to_string(),
            "template0".to_string(),
            "metrics".to_string(),
        ];
        assert_eq!(filter_system_databases(names), vec!["appdb", "metrics"]);
    }
}
