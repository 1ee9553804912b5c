#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use pk_auth::{
    AccountLabel, AuthConfig, AuthError, CredentialRecord, CredentialStore, Endpoints, GameToken,
    Identity, MemoryCredentialStore, PrimaryToken, RefreshCoordinator, Result,
};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_PATH: &str = "/consumers/oauth2/v2.0/token";
pub const DEVICE_CODE_PATH: &str = "/consumers/oauth2/v2.0/devicecode";
pub const XBL_PATH: &str = "/user/authenticate";
pub const XSTS_PATH: &str = "/xsts/authorize";
pub const LOGIN_PATH: &str = "/authentication/login_with_xbox";
pub const PROFILE_PATH: &str = "/minecraft/profile";

/// Memory store that counts saves and can be told to reject them
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: MemoryCredentialStore,
    saves: AtomicUsize,
    fail_saves: bool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Seed a record without counting it as a save
    pub async fn seed(&self, label: &AccountLabel, record: &CredentialRecord) {
        self.inner.save(label, record).await.unwrap();
    }
}

#[async_trait]
impl CredentialStore for CountingStore {
    async fn load(&self, label: &AccountLabel) -> Result<CredentialRecord> {
        self.inner.load(label).await
    }

    async fn save(&self, label: &AccountLabel, record: &CredentialRecord) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves {
            return Err(AuthError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(label, record).await
    }

    async fn list_labels(&self) -> Result<Vec<AccountLabel>> {
        self.inner.list_labels().await
    }
}

pub fn coordinator(server: &MockServer, store: Arc<CountingStore>) -> RefreshCoordinator {
    let base = Url::parse(&server.uri()).unwrap();
    let config =
        AuthConfig::new("test-client").with_endpoints(Endpoints::with_base(&base).unwrap());
    RefreshCoordinator::new(&config, store).unwrap()
}

pub fn record(primary_expires_at: DateTime<Utc>, game_expires_at: DateTime<Utc>) -> CredentialRecord {
    CredentialRecord {
        primary: PrimaryToken {
            access_token: "old-ms-access".to_string(),
            refresh_token: "old-ms-refresh".to_string(),
            expires_at: primary_expires_at,
        },
        game: GameToken {
            token: "old-mc-token".to_string(),
            expires_at: game_expires_at,
        },
        identity: Identity {
            unique_id: "old-uuid".to_string(),
            display_name: "OldName".to_string(),
        },
    }
}

pub fn in_hours(hours: i64) -> DateTime<Utc> {
    Utc::now() + TimeDelta::hours(hours)
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - TimeDelta::hours(hours)
}

/// Refresh grant answering with a new token pair
pub async fn mount_refresh(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-ms-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "access_token": "new-ms-access",
            "refresh_token": "new-ms-refresh",
            "expires_in": 3600
        })))
        .expect(expected)
        .mount(server)
        .await;
}

pub async fn mount_xbl(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path(XBL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Token": "xbl-ticket",
            "DisplayClaims": { "xui": [{ "uhs": "uhs-1" }] }
        })))
        .expect(expected)
        .mount(server)
        .await;
}

pub async fn mount_xsts(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path(XSTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Token": "xsts-token",
            "DisplayClaims": { "xui": [{ "uhs": "uhs-1" }] }
        })))
        .expect(expected)
        .mount(server)
        .await;
}

pub async fn mount_login(server: &MockServer, expires_in: u64, expected: u64) {
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "username": "some-guid",
            "access_token": "new-mc-token",
            "token_type": "Bearer",
            "expires_in": expires_in
        })))
        .expect(expected)
        .mount(server)
        .await;
}

pub async fn mount_profile(server: &MockServer, expected: u64) {
    Mock::given(method("GET"))
        .and(path(PROFILE_PATH))
        .and(header("authorization", "Bearer new-mc-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "0123456789abcdef0123456789abcdef",
            "name": "Steve"
        })))
        .expect(expected)
        .mount(server)
        .await;
}

/// Mount all four exchange stages, each expected `expected` times
pub async fn mount_chain(server: &MockServer, expected: u64) {
    mount_xbl(server, expected).await;
    mount_xsts(server, expected).await;
    mount_login(server, 86400, expected).await;
    mount_profile(server, expected).await;
}
