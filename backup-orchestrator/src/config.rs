use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub log_level: String,
    /// Local scratch area for dumps, two-hop transfers and restore staging.
    pub staging_dir: PathBuf,
    /// Overall per-job timeout; a stuck remote session fails the job instead
    /// of blocking the request forever.
    pub job_timeout: Duration,
    pub search_repo_name: String,
    pub search_repo_path: PathBuf,
    pub wide_column_data_dir: String,
    pub wide_column_service: String,
    pub wide_column_owner: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            staging_dir: PathBuf::from(
                std::env::var("STAGING_DIR").unwrap_or_else(|_| "/tmp/backup-orchestrator".into()),
            ),
            job_timeout: Duration::from_secs(
                std::env::var("JOB_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            search_repo_name: std::env::var("SEARCH_REPO_NAME")
                .unwrap_or_else(|_| "backup_repo".into()),
            search_repo_path: PathBuf::from(
                std::env::var("SEARCH_REPO_PATH").unwrap_or_else(|_| "/mnt/backups".into()),
            ),
            wide_column_data_dir: std::env::var("WIDE_COLUMN_DATA_DIR")
                .unwrap_or_else(|_| "/var/lib/scylla/data".into()),
            wide_column_service: std::env::var("WIDE_COLUMN_SERVICE")
                .unwrap_or_else(|_| "scylla-server".into()),
            wide_column_owner: std::env::var("WIDE_COLUMN_OWNER")
                .unwrap_or_else(|_| "scylla".into()),
        }
    }
}
