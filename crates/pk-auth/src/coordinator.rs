use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::AuthConfig;
use crate::device_flow::{DeviceCodeNotice, DeviceFlowAuthenticator};
use crate::errors::{AuthError, Result, TokenKind};
use crate::exchange::TokenExchangeChain;
use crate::expiry::ExpiryPolicy;
use crate::record::{AccountLabel, CredentialRecord, Identity};
use crate::store::CredentialStore;

/// Result of a successful `ensure_valid`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub record: CredentialRecord,
    pub primary_refreshed: bool,
    pub game_refreshed: bool,
}

impl RefreshOutcome {
    /// Whether anything was refreshed (and therefore saved)
    pub fn changed(&self) -> bool {
        self.primary_refreshed || self.game_refreshed
    }
}

/// A failed coordinator operation.
///
/// `record` is what the caller should keep using: the untouched original when a
/// refresh or exchange failed, or the freshly updated record when only saving it
/// failed (the stored copy is then older than the one in memory).
#[derive(Error, Debug)]
#[error("{error}")]
pub struct CredentialFailure {
    pub record: Option<CredentialRecord>,
    #[source]
    pub error: AuthError,
}

impl CredentialFailure {
    fn keep(record: CredentialRecord, error: AuthError) -> Self {
        Self {
            record: Some(record),
            error,
        }
    }
}

impl From<AuthError> for CredentialFailure {
    fn from(error: AuthError) -> Self {
        Self {
            record: None,
            error,
        }
    }
}

/// Validity of one token at the time of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid { remaining: TimeDelta },
    Expired { expired_at: DateTime<Utc> },
}

/// Read-only report on a stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStatus {
    pub label: AccountLabel,
    pub identity: Identity,
    pub primary: TokenState,
    pub game: TokenState,
}

impl CredentialStatus {
    pub fn is_fully_valid(&self) -> bool {
        matches!(self.primary, TokenState::Valid { .. })
            && matches!(self.game, TokenState::Valid { .. })
    }
}

/// Keeps every managed account's credentials usable.
///
/// Refreshes only what is stale, persists only complete results, and runs at
/// most one operation per account label at a time.
pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    authenticator: DeviceFlowAuthenticator,
    chain: TokenExchangeChain,
    policy: ExpiryPolicy,
    locks: Mutex<HashMap<AccountLabel, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("authenticator", &self.authenticator)
            .field("chain", &self.chain)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    pub fn new(config: &AuthConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let http = config.http_client()?;
        Ok(Self {
            store,
            authenticator: DeviceFlowAuthenticator::with_client(http.clone(), config),
            chain: TokenExchangeChain::with_client(http, config.endpoints.clone()),
            policy: ExpiryPolicy::new(config.expiry_margin),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn authenticator(&self) -> &DeviceFlowAuthenticator {
        &self.authenticator
    }

    pub fn chain(&self) -> &TokenExchangeChain {
        &self.chain
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    fn label_lock(&self, label: &AccountLabel) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(label.clone()).or_default().clone()
    }

    /// Refresh whatever is stale in `record` and save the result under `label`
    #[instrument(skip(self, label, record), fields(label = %label))]
    pub async fn ensure_valid(
        &self,
        label: &AccountLabel,
        record: CredentialRecord,
    ) -> std::result::Result<RefreshOutcome, CredentialFailure> {
        let lock = self.label_lock(label);
        let _guard = lock.lock().await;
        self.refresh_locked(label, record).await
    }

    /// Load the stored record for `label` and make it valid
    #[instrument(skip(self, label), fields(label = %label))]
    pub async fn ensure_valid_for(
        &self,
        label: &AccountLabel,
    ) -> std::result::Result<RefreshOutcome, CredentialFailure> {
        let lock = self.label_lock(label);
        let _guard = lock.lock().await;
        let record = self.store.load(label).await?;
        self.refresh_locked(label, record).await
    }

    async fn refresh_locked(
        &self,
        label: &AccountLabel,
        record: CredentialRecord,
    ) -> std::result::Result<RefreshOutcome, CredentialFailure> {
        let now = Utc::now();
        let mut updated = record.clone();
        let mut primary_refreshed = false;
        let mut game_refreshed = false;

        if self.policy.is_expired(record.primary.expires_at, now) {
            info!("Primary token expired, refreshing");
            match self
                .authenticator
                .refresh_primary(&record.primary.refresh_token)
                .await
            {
                Ok(primary) => {
                    updated.primary = primary;
                    primary_refreshed = true;
                }
                Err(e) => {
                    warn!("Primary token refresh failed: {}", e);
                    return Err(CredentialFailure::keep(record, e.into()));
                }
            }
        }

        if primary_refreshed || self.policy.is_expired(record.game.expires_at, now) {
            info!("Game token expired or primary token changed, running exchange chain");
            match self.chain.run_full_chain(&updated.primary.access_token).await {
                Ok(output) => {
                    updated.game = output.game;
                    updated.identity = output.identity;
                    game_refreshed = true;
                }
                Err(e) => {
                    warn!("Token exchange failed: {}", e);
                    return Err(CredentialFailure::keep(record, e.into()));
                }
            }
        }

        if let Some(token) = self.first_expired(&updated, Utc::now()) {
            warn!("{} token still expired after refresh", token);
            return Err(CredentialFailure::keep(
                record,
                AuthError::TokenStillExpired { token },
            ));
        }

        let outcome = RefreshOutcome {
            record: updated,
            primary_refreshed,
            game_refreshed,
        };

        if outcome.changed() {
            if let Err(e) = self.store.save(label, &outcome.record).await {
                warn!("Refreshed credentials could not be saved: {}", e);
                return Err(CredentialFailure::keep(outcome.record, e));
            }
            info!(
                primary = primary_refreshed,
                game = game_refreshed,
                name = %outcome.record.identity.display_name,
                "Credentials refreshed"
            );
        }

        Ok(outcome)
    }

    fn first_expired(&self, record: &CredentialRecord, now: DateTime<Utc>) -> Option<TokenKind> {
        if self.policy.is_expired(record.primary.expires_at, now) {
            Some(TokenKind::Primary)
        } else if self.policy.is_expired(record.game.expires_at, now) {
            Some(TokenKind::Game)
        } else {
            None
        }
    }

    /// Report on the stored record without refreshing anything
    pub async fn check(&self, label: &AccountLabel) -> Result<CredentialStatus> {
        let record = self.store.load(label).await?;
        let now = Utc::now();
        let state = |expires_at: DateTime<Utc>| match self.policy.remaining(expires_at, now) {
            Some(remaining) => TokenState::Valid { remaining },
            None => TokenState::Expired {
                expired_at: expires_at,
            },
        };

        Ok(CredentialStatus {
            label: label.clone(),
            primary: state(record.primary.expires_at),
            game: state(record.game.expires_at),
            identity: record.identity,
        })
    }

    /// Enrol an account through the interactive device-code flow.
    ///
    /// `deliver` receives the one-time code before polling starts; the host
    /// decides how to show it. Holds the label's lock until the new record is
    /// saved, so refreshes of the same account wait for enrolment to finish.
    #[instrument(skip(self, label, deliver, cancel), fields(label = %label))]
    pub async fn authenticate_new<F>(
        &self,
        label: &AccountLabel,
        deliver: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<CredentialRecord, CredentialFailure>
    where
        F: FnOnce(DeviceCodeNotice) + Send,
    {
        let lock = self.label_lock(label);
        let _guard = lock.lock().await;

        let session = self.authenticator.start_device_flow().await?;
        deliver(session.notice());

        let primary = self
            .authenticator
            .poll_until_complete(&session, cancel)
            .await?;
        info!("Microsoft authentication completed, getting Minecraft credentials");

        let output = self
            .chain
            .run_full_chain(&primary.access_token)
            .await
            .map_err(AuthError::from)?;

        let record = CredentialRecord {
            primary,
            game: output.game,
            identity: output.identity,
        };

        if let Err(e) = self.store.save(label, &record).await {
            warn!("New credentials could not be saved: {}", e);
            return Err(CredentialFailure::keep(record, e));
        }

        info!(
            name = %record.identity.display_name,
            uuid = %record.identity.unique_id,
            "Account authenticated"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCredentialStore;

    fn coordinator() -> RefreshCoordinator {
        RefreshCoordinator::new(
            &AuthConfig::new("test-client"),
            Arc::new(MemoryCredentialStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_label_lock_is_shared_per_label() {
        let coordinator = coordinator();
        let a = coordinator.label_lock(&AccountLabel::new("a"));
        let again = coordinator.label_lock(&AccountLabel::new("a"));
        let b = coordinator.label_lock(&AccountLabel::new("b"));

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_empty_client_id_is_rejected() {
        let err = RefreshCoordinator::new(
            &AuthConfig::new(""),
            Arc::new(MemoryCredentialStore::new()),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfig(_)));
    }

    #[test]
    fn test_failure_display_is_the_underlying_error() {
        let failure = CredentialFailure::from(AuthError::Cancelled);
        assert_eq!(failure.to_string(), AuthError::Cancelled.to_string());
        assert!(failure.record.is_none());
    }
}
