use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{AuthError, Result};
use crate::record::{AccountLabel, CredentialRecord};

/// Durable storage for one credential record per account label
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the record for a label, `NotFound` if none was ever saved
    async fn load(&self, label: &AccountLabel) -> Result<CredentialRecord>;

    /// Replace the record for a label; readers never observe a partial write
    async fn save(&self, label: &AccountLabel, record: &CredentialRecord) -> Result<()>;

    /// List all stored account labels
    async fn list_labels(&self) -> Result<Vec<AccountLabel>>;
}

/// In-memory credential store for testing and embedding hosts
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    records: Arc<RwLock<HashMap<AccountLabel, CredentialRecord>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> AuthError {
    AuthError::Io(std::io::Error::other("credential store lock poisoned"))
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, label: &AccountLabel) -> Result<CredentialRecord> {
        self.records
            .read()
            .map_err(|_| poisoned())?
            .get(label)
            .cloned()
            .ok_or_else(|| AuthError::NotFound {
                label: label.to_string(),
            })
    }

    async fn save(&self, label: &AccountLabel, record: &CredentialRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert(label.clone(), record.clone());
        Ok(())
    }

    async fn list_labels(&self) -> Result<Vec<AccountLabel>> {
        let mut labels: Vec<_> = self
            .records
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect();
        labels.sort();
        Ok(labels)
    }
}
