use std::sync::Arc;

use crate::config::AppConfig;
use crate::pipeline::Orchestrator;
use crate::remote::{RemoteConnector, SshConnector};

pub struct AppState {
    pub config: AppConfig,
    pub connector: Arc<dyn RemoteConnector>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            connector: Arc::new(SshConnector),
        }
    }

    /// Each request gets its own orchestrator; jobs share nothing.
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.connector.clone(),
            self.config.staging_dir.clone(),
            self.config.job_timeout,
        )
    }
}
