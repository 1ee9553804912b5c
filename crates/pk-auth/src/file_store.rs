use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::errors::{AuthError, Result};
use crate::record::{AccountLabel, CredentialRecord};
use crate::store::CredentialStore;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON-file credential store
///
/// Stores one pretty-printed JSON document per account label.
///
/// # Directory Structure
/// ```text
/// ~/.local/share/pearlkeeper/credentials/
/// ├── main-bot.json        # record for label "main-bot"
/// └── room%202.json        # record for label "room 2"
/// ```
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        Ok(Self { dir })
    }

    /// Get default storage directory for the current platform
    pub fn default_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("", "", "pearlkeeper").ok_or_else(|| {
            AuthError::InvalidConfig("Could not determine data directory".to_string())
        })?;

        Ok(project_dirs.data_dir().join("credentials"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, label: &AccountLabel) -> PathBuf {
        self.dir.join(format!("{}.json", label.file_stem()))
    }

    fn temp_path(&self, label: &AccountLabel) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.{}.{}.tmp",
            label.file_stem(),
            std::process::id(),
            n
        ))
    }

    async fn write_atomically(&self, label: &AccountLabel, contents: &[u8]) -> std::io::Result<()> {
        let path = self.record_path(label);
        let temp_path = self.temp_path(label);

        let result = async {
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options.open(&temp_path).await?;
            file.write_all(contents).await?;
            file.sync_all().await?;
            drop(file);

            fs::rename(&temp_path, &path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self, label), fields(label = %label))]
    async fn load(&self, label: &AccountLabel) -> Result<CredentialRecord> {
        let path = self.record_path(label);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credential file at {}", path.display());
                return Err(AuthError::NotFound {
                    label: label.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content).map_err(|e| {
            warn!("Credential file {} is corrupt: {}", path.display(), e);
            AuthError::CorruptCache {
                label: label.to_string(),
                reason: e.to_string(),
            }
        })
    }

    #[instrument(skip(self, label, record), fields(label = %label))]
    async fn save(&self, label: &AccountLabel, record: &CredentialRecord) -> Result<()> {
        let contents = serde_json::to_vec_pretty(record)
            .map_err(|e| AuthError::Io(std::io::Error::other(e)))?;

        self.write_atomically(label, &contents).await?;
        debug!("Saved credentials to {}", self.record_path(label).display());
        Ok(())
    }

    async fn list_labels(&self) -> Result<Vec<AccountLabel>> {
        let mut labels = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(AccountLabel::from_file_stem)
            {
                Some(label) => labels.push(label),
                None => warn!("Skipping unrecognized file {}", path.display()),
            }
        }

        labels.sort();
        Ok(labels)
    }
}
