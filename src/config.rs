use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use pk_auth::{AuthConfig, FileCredentialStore, HttpTimeouts};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Host configuration read from `config.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Azure application (client) ID used for device-code sign-in
    pub client_id: String,
    pub credentials_dir: Option<PathBuf>,
    pub expiry_margin_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl HostConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if config.client_id.trim().is_empty() {
            anyhow::bail!("client_id in {} is empty", path.display());
        }
        Ok(config)
    }

    pub fn default_path() -> anyhow::Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "pearlkeeper").context("Failed to get project directories")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn credentials_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.credentials_dir {
            Some(dir) => Ok(dir.clone()),
            None => FileCredentialStore::default_dir()
                .context("Failed to determine default credentials directory"),
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        let mut config = AuthConfig::new(self.client_id.clone());

        if let Some(secs) = self.expiry_margin_secs {
            config = config.with_expiry_margin(Duration::from_secs(secs));
        }
        if let Some(secs) = self.request_timeout_secs {
            config = config.with_timeouts(HttpTimeouts {
                connect: Duration::from_secs(secs),
                request: Duration::from_secs(secs),
            });
        }
        config
    }
}
