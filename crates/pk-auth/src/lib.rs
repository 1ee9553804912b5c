//! Credential engine for Minecraft accounts backed by Microsoft sign-in
//!
//! Keeps a per-account credential record usable: a Microsoft OAuth token pair
//! (the "primary" token) plus a Minecraft services token (the "game" token)
//! and the player's identity. Tokens are refreshed only when they are inside
//! the expiry margin, and only complete, verified records are persisted.
//!
//! # Authentication Flow
//!
//! 1. Device-code authorization with Microsoft (user enters a short code)
//! 2. Xbox Live authentication
//! 3. XSTS authorization
//! 4. Minecraft Services login
//! 5. Profile retrieval
//!
//! Steps 2-5 are the exchange chain and run again whenever the game token
//! expires or the primary token is refreshed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pk_auth::{AccountLabel, AuthConfig, FileCredentialStore, RefreshCoordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pk_auth::Result<()> {
//! let store = FileCredentialStore::new(FileCredentialStore::default_dir()?).await?;
//! let coordinator = RefreshCoordinator::new(&AuthConfig::new("my-client-id"), Arc::new(store))?;
//! let label = AccountLabel::new("main");
//!
//! let record = coordinator
//!     .authenticate_new(
//!         &label,
//!         |notice| println!("Go to {} and enter {}", notice.verification_uri, notice.user_code),
//!         &CancellationToken::new(),
//!     )
//!     .await
//!     .map_err(|failure| failure.error)?;
//! println!("Logged in as: {}", record.identity.display_name);
//!
//! // Later, before launching the game
//! let outcome = coordinator
//!     .ensure_valid_for(&label)
//!     .await
//!     .map_err(|failure| failure.error)?;
//! println!("Game token valid until {}", outcome.record.game.expires_at);
//! # Ok(())
//! # }
//! ```
//!
//! # Credential Storage
//!
//! Records are kept behind the [`CredentialStore`] trait.
//!
//! ```
//! use chrono::Utc;
//! use pk_auth::{
//!     AccountLabel, CredentialRecord, CredentialStore, GameToken, Identity,
//!     MemoryCredentialStore, PrimaryToken,
//! };
//!
//! # async fn example() -> pk_auth::Result<()> {
//! let store = MemoryCredentialStore::new();
//! let now = Utc::now();
//! let record = CredentialRecord {
//!     primary: PrimaryToken::issued("access".into(), "refresh".into(), 3600, now),
//!     game: GameToken::issued("game".into(), 86400, now),
//!     identity: Identity {
//!         unique_id: "uuid".into(),
//!         display_name: "Player".into(),
//!     },
//! };
//!
//! let label = AccountLabel::new("main");
//! store.save(&label, &record).await?;
//! assert_eq!(store.load(&label).await?, record);
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! [`FileCredentialStore`] writes one JSON file per account, atomically and
//! readable only by the current user.

pub mod config;
pub mod coordinator;
pub mod device_flow;
pub mod errors;
pub mod exchange;
pub mod expiry;
pub mod file_store;
pub mod models;
pub mod record;
pub mod store;

pub use config::{AuthConfig, Endpoints, HttpTimeouts};
pub use coordinator::{
    CredentialFailure, CredentialStatus, RefreshCoordinator, RefreshOutcome, TokenState,
};
pub use device_flow::{
    DeviceCodeNotice, DeviceFlowAuthenticator, DeviceFlowHandle, DeviceFlowSession,
    DeviceFlowStatus, PollReply,
};
pub use errors::{
    AuthError, ExchangeError, ExchangeFailure, ExchangeStage, PrimaryRefreshError, Result,
    TokenKind, XstsDenial,
};
pub use exchange::{ChainOutput, TokenExchangeChain, XstsToken};
pub use expiry::ExpiryPolicy;
pub use file_store::FileCredentialStore;
pub use record::{AccountLabel, CredentialRecord, GameToken, Identity, PrimaryToken};
pub use store::{CredentialStore, MemoryCredentialStore};
