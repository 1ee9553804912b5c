use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{AuthConfig, Endpoints, DEVICE_FLOW_SCOPE};
use crate::errors::{snippet, AuthError, PrimaryRefreshError, Result};
use crate::expiry::expires_after;
use crate::models::{DeviceCodeResponse, MsTokenResponse, OAuthErrorResponse};
use crate::record::PrimaryToken;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Extra wait added to the poll interval after a `slow_down` reply
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// One pending device-code authorization.
///
/// Lives only for the duration of a single sign-in attempt and is never
/// persisted.
#[derive(Debug, Clone)]
pub struct DeviceFlowSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in_secs: u64,
    pub expires_at: DateTime<Utc>,
    pub poll_interval_secs: u64,
    /// Human-readable instructions supplied by the provider
    pub message: Option<String>,
}

impl DeviceFlowSession {
    /// What the host needs to show the person signing in
    pub fn notice(&self) -> DeviceCodeNotice {
        DeviceCodeNotice {
            user_code: self.user_code.clone(),
            verification_uri: self.verification_uri.clone(),
            expires_in_secs: self.expires_in_secs,
            message: self.message.clone(),
        }
    }
}

/// Payload handed to the host's delivery channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeNotice {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in_secs: u64,
    pub message: Option<String>,
}

/// Outcome of one non-terminal poll attempt
#[derive(Debug, Clone)]
pub enum PollReply {
    Pending,
    SlowDown,
    Authorized(PrimaryToken),
}

/// Progress of a background poll task
#[derive(Debug, Clone)]
pub enum DeviceFlowStatus {
    Pending { attempts: u32 },
    Succeeded(PrimaryToken),
    Failed { message: String },
}

/// Handle to a poll loop running on its own task
#[derive(Debug)]
pub struct DeviceFlowHandle {
    status: watch::Receiver<DeviceFlowStatus>,
    cancel: CancellationToken,
    task: JoinHandle<Result<PrimaryToken>>,
}

impl DeviceFlowHandle {
    /// Subscribe to status transitions
    pub fn status(&self) -> watch::Receiver<DeviceFlowStatus> {
        self.status.clone()
    }

    /// Ask the poll loop to stop; `wait` then returns `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<PrimaryToken> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AuthError::Cancelled),
            Err(e) => Err(AuthError::TaskAborted(e.to_string())),
        }
    }
}

/// Obtains and refreshes the primary (Microsoft) token.
#[derive(Debug, Clone)]
pub struct DeviceFlowAuthenticator {
    http: Client,
    client_id: String,
    endpoints: Endpoints,
}

impl DeviceFlowAuthenticator {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        Ok(Self::with_client(config.http_client()?, config))
    }

    pub(crate) fn with_client(http: Client, config: &AuthConfig) -> Self {
        Self {
            http,
            client_id: config.client_id.clone(),
            endpoints: config.endpoints.clone(),
        }
    }

    /// Request a device code and user code from the identity provider
    #[instrument(skip(self))]
    pub async fn start_device_flow(&self) -> Result<DeviceFlowSession> {
        debug!("Requesting device code");
        let requested_at = Utc::now();
        let response = self
            .http
            .post(self.endpoints.device_code.clone())
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", DEVICE_FLOW_SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::Provider(format!(
                "device code request answered HTTP {}: {}",
                status,
                snippet(&text)
            )));
        }

        let body: DeviceCodeResponse = serde_json::from_str(&text).map_err(|e| {
            AuthError::Provider(format!("malformed device code response: {e}"))
        })?;
        let missing =
            |field: &str| AuthError::Provider(format!("device code response is missing '{field}'"));

        let device_code = body.device_code.ok_or_else(|| missing("device_code"))?;
        let user_code = body.user_code.ok_or_else(|| missing("user_code"))?;
        let verification_uri = body.verification_uri.ok_or_else(|| missing("verification_uri"))?;
        let expires_in_secs = body.expires_in.ok_or_else(|| missing("expires_in"))?;
        let poll_interval_secs = body.interval.ok_or_else(|| missing("interval"))?;

        info!(
            expires_in = expires_in_secs,
            interval = poll_interval_secs,
            "Device code issued"
        );

        Ok(DeviceFlowSession {
            device_code,
            user_code,
            verification_uri,
            expires_in_secs,
            expires_at: expires_after(requested_at, expires_in_secs),
            poll_interval_secs,
            message: body.message,
        })
    }

    /// Ask the token endpoint once whether the user has finished signing in
    #[instrument(skip_all)]
    pub async fn poll_once(&self, session: &DeviceFlowSession) -> Result<PollReply> {
        let acquired_at = Utc::now();
        let response = self
            .http
            .post(self.endpoints.token.clone())
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", DEVICE_FLOW_SCOPE),
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", session.device_code.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::OK {
            let body: MsTokenResponse = serde_json::from_str(&text)
                .map_err(|e| AuthError::Provider(format!("malformed token response: {e}")))?;
            return issued_token(body, None, acquired_at)
                .map(PollReply::Authorized)
                .map_err(AuthError::Provider);
        }

        if !status.is_client_error() {
            return Err(AuthError::UnexpectedStatus {
                status,
                body_snippet: snippet(&text),
            });
        }

        let error = serde_json::from_str::<OAuthErrorResponse>(&text).ok();
        let code = error.as_ref().and_then(|e| e.error.as_deref());
        match code {
            Some("authorization_pending") => Ok(PollReply::Pending),
            Some("slow_down") => Ok(PollReply::SlowDown),
            Some("authorization_declined") | Some("access_denied") => Err(AuthError::UserDeclined),
            Some("expired_token") => Err(AuthError::SessionExpired),
            Some("invalid_grant") => Err(AuthError::InvalidGrant {
                description: error
                    .as_ref()
                    .and_then(|e| e.error_description.clone())
                    .unwrap_or_default(),
            }),
            _ => Err(AuthError::UnknownProviderError {
                status,
                body_snippet: snippet(&text),
            }),
        }
    }

    /// Poll until the user signs in, declines, or the session runs out.
    ///
    /// Waits `interval + 1` seconds before every attempt. Returns `Cancelled`
    /// as soon as `cancel` fires.
    pub async fn poll_until_complete(
        &self,
        session: &DeviceFlowSession,
        cancel: &CancellationToken,
    ) -> Result<PrimaryToken> {
        self.poll_loop(session, cancel, |_| {}).await
    }

    #[instrument(skip_all, fields(user_code = %session.user_code))]
    async fn poll_loop(
        &self,
        session: &DeviceFlowSession,
        cancel: &CancellationToken,
        mut on_attempt: impl FnMut(u32),
    ) -> Result<PrimaryToken> {
        let mut interval_secs = session.poll_interval_secs;
        let mut attempts = 0u32;

        loop {
            let wait = Duration::from_secs(interval_secs.saturating_add(1));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            if Utc::now() >= session.expires_at {
                warn!("Device code expired after {} attempts", attempts);
                return Err(AuthError::SessionExpired);
            }

            attempts += 1;
            on_attempt(attempts);

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                reply = self.poll_once(session) => reply?,
            };

            match reply {
                PollReply::Pending => debug!(attempts, "Authorization pending"),
                PollReply::SlowDown => {
                    interval_secs = interval_secs.saturating_add(SLOW_DOWN_STEP_SECS);
                    debug!(attempts, interval_secs, "Provider asked to slow down");
                }
                PollReply::Authorized(token) => {
                    info!(attempts, "Device code authorized");
                    return Ok(token);
                }
            }
        }
    }

    /// Run the poll loop on its own task, publishing progress on a watch channel
    pub fn spawn_poll(&self, session: DeviceFlowSession) -> DeviceFlowHandle {
        let (tx, rx) = watch::channel(DeviceFlowStatus::Pending { attempts: 0 });
        let cancel = CancellationToken::new();
        let authenticator = self.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let result = authenticator
                .poll_loop(&session, &task_cancel, |attempts| {
                    tx.send_replace(DeviceFlowStatus::Pending { attempts });
                })
                .await;

            tx.send_replace(match &result {
                Ok(token) => DeviceFlowStatus::Succeeded(token.clone()),
                Err(e) => DeviceFlowStatus::Failed {
                    message: e.to_string(),
                },
            });
            result
        });

        DeviceFlowHandle {
            status: rx,
            cancel,
            task,
        }
    }

    /// Redeem a refresh token for a new primary token
    #[instrument(skip_all)]
    pub async fn refresh_primary(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<PrimaryToken, PrimaryRefreshError> {
        debug!("Refreshing Microsoft access token");
        let acquired_at = Utc::now();
        let response = self
            .http
            .post(self.endpoints.token.clone())
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", DEVICE_FLOW_SCOPE),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            if let Ok(OAuthErrorResponse {
                error: Some(code),
                error_description,
            }) = serde_json::from_str::<OAuthErrorResponse>(&text)
                && code == "invalid_grant"
            {
                return Err(PrimaryRefreshError::InvalidGrant {
                    description: error_description.unwrap_or_default(),
                });
            }
            return Err(PrimaryRefreshError::Status {
                status,
                body_snippet: snippet(&text),
            });
        }

        let body: MsTokenResponse = serde_json::from_str(&text)
            .map_err(|e| PrimaryRefreshError::MalformedBody(e.to_string()))?;
        issued_token(body, Some(refresh_token), acquired_at).map_err(PrimaryRefreshError::MalformedBody)
    }
}

/// Validate a token endpoint success body.
///
/// `previous_refresh` is reused when the provider does not rotate the refresh
/// token.
fn issued_token(
    body: MsTokenResponse,
    previous_refresh: Option<&str>,
    acquired_at: DateTime<Utc>,
) -> std::result::Result<PrimaryToken, String> {
    let access_token = body
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or("token response is missing 'access_token'")?;
    let refresh_token = body
        .refresh_token
        .filter(|t| !t.is_empty())
        .or_else(|| previous_refresh.map(str::to_string))
        .ok_or("token response is missing 'refresh_token'")?;
    let expires_in = body
        .expires_in
        .ok_or("token response is missing 'expires_in'")?;

    Ok(PrimaryToken::issued(
        access_token,
        refresh_token,
        expires_in,
        acquired_at,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn authenticator_for(server: &MockServer) -> DeviceFlowAuthenticator {
        let base = url::Url::parse(&server.uri()).unwrap();
        let config =
            AuthConfig::new("test-client").with_endpoints(Endpoints::with_base(&base).unwrap());
        DeviceFlowAuthenticator::new(&config).unwrap()
    }

    fn session(expires_in: i64) -> DeviceFlowSession {
        DeviceFlowSession {
            device_code: "device-123".to_string(),
            user_code: "ABCD-EFGH".to_string(),
            verification_uri: "https://www.microsoft.com/link".to_string(),
            expires_in_secs: expires_in.max(0) as u64,
            expires_at: Utc::now() + TimeDelta::milliseconds(expires_in * 1000),
            poll_interval_secs: 0,
            message: None,
        }
    }

    fn token_path() -> &'static str {
        "/consumers/oauth2/v2.0/token"
    }

    #[tokio::test]
    async fn test_start_device_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .and(body_string_contains("client_id=test-client"))
            .and(body_string_contains("scope=XboxLive.signin+offline_access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "device-123",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://www.microsoft.com/link",
                "expires_in": 900,
                "interval": 5,
                "message": "To sign in, use a web browser to open the page https://www.microsoft.com/link and enter the code ABCD-EFGH to authenticate."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = authenticator_for(&server).start_device_flow().await.unwrap();

        assert_eq!(session.device_code, "device-123");
        assert_eq!(session.user_code, "ABCD-EFGH");
        assert_eq!(session.poll_interval_secs, 5);
        assert!(session.expires_at > Utc::now() + TimeDelta::seconds(890));

        let notice = session.notice();
        assert_eq!(notice.verification_uri, "https://www.microsoft.com/link");
        assert_eq!(notice.expires_in_secs, 900);
        assert!(notice.message.is_some());
    }

    #[tokio::test]
    async fn test_start_device_flow_missing_interval() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "device-123",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://www.microsoft.com/link",
                "expires_in": 900
            })))
            .mount(&server)
            .await;

        let err = authenticator_for(&server).start_device_flow().await.unwrap_err();
        assert!(matches!(err, AuthError::Provider(msg) if msg.contains("interval")));
    }

    #[tokio::test]
    async fn test_start_device_flow_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_client"
            })))
            .mount(&server)
            .await;

        let err = authenticator_for(&server).start_device_flow().await.unwrap_err();
        assert!(matches!(err, AuthError::Provider(msg) if msg.contains("400")));
    }

    #[tokio::test]
    async fn test_pending_then_success_polls_n_plus_one_times() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending",
                "error_description": "AADSTS70016: OAuth 2.0 device flow error."
            })))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .and(body_string_contains("device_code=device-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "scope": "XboxLive.signin offline_access",
                "access_token": "ms-access",
                "refresh_token": "ms-refresh",
                "expires_in": 3600
            })))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let token = authenticator_for(&server)
            .poll_until_complete(&session(600), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(token.access_token, "ms-access");
        assert_eq!(token.refresh_token, "ms-refresh");
        assert!(token.expires_at > Utc::now() + TimeDelta::seconds(3500));
        // one interval + 1s wait before each of the three attempts
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_declined_stops_after_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_declined"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = authenticator_for(&server)
            .poll_until_complete(&session(600), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserDeclined));
    }

    async fn poll_once_with(status: u16, body: serde_json::Value) -> Result<PollReply> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;

        authenticator_for(&server).poll_once(&session(600)).await
    }

    #[tokio::test]
    async fn test_poll_reply_classification() {
        assert!(matches!(
            poll_once_with(400, json!({ "error": "expired_token" })).await,
            Err(AuthError::SessionExpired)
        ));
        assert!(matches!(
            poll_once_with(400, json!({ "error": "slow_down" })).await,
            Ok(PollReply::SlowDown)
        ));
        assert!(matches!(
            poll_once_with(400, json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: code already redeemed"
            }))
            .await,
            Err(AuthError::InvalidGrant { description }) if description.contains("AADSTS70000")
        ));
        assert!(matches!(
            poll_once_with(403, json!({ "something": "else" })).await,
            Err(AuthError::UnknownProviderError { status, .. }) if status == StatusCode::FORBIDDEN
        ));
        assert!(matches!(
            poll_once_with(400, json!({ "error": "bad_verification_code" })).await,
            Err(AuthError::UnknownProviderError { .. })
        ));
        assert!(matches!(
            poll_once_with(503, json!({})).await,
            Err(AuthError::UnexpectedStatus { status, .. }) if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert!(matches!(
            poll_once_with(200, json!({ "access_token": "a", "expires_in": 10 })).await,
            Err(AuthError::Provider(msg)) if msg.contains("refresh_token")
        ));
    }

    #[tokio::test]
    async fn test_deadline_expires_without_polling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending"
            })))
            .expect(0)
            .mount(&server)
            .await;

        let err = authenticator_for(&server)
            .poll_until_complete(&session(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionExpired));
    }

    #[tokio::test]
    async fn test_cancelled_background_poll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending"
            })))
            .expect(0)
            .mount(&server)
            .await;

        let handle = authenticator_for(&server).spawn_poll(session(600));
        let status = handle.status();
        handle.cancel();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert!(matches!(
            &*status.borrow(),
            DeviceFlowStatus::Failed { message } if message.contains("cancelled")
        ));
    }

    #[tokio::test]
    async fn test_background_poll_publishes_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ms-access",
                "refresh_token": "ms-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = authenticator_for(&server).spawn_poll(session(600));
        let mut status = handle.status();

        let token = handle.wait().await.unwrap();
        assert_eq!(token.access_token, "ms-access");

        let last = status.borrow_and_update().clone();
        assert!(matches!(last, DeviceFlowStatus::Succeeded(t) if t == token));
    }

    #[tokio::test]
    async fn test_refresh_primary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = authenticator_for(&server)
            .refresh_primary("old-refresh")
            .await
            .unwrap();
        assert_eq!(token.access_token, "new-access");
        assert_eq!(token.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn test_refresh_primary_keeps_unrotated_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let token = authenticator_for(&server)
            .refresh_primary("old-refresh")
            .await
            .unwrap();
        assert_eq!(token.refresh_token, "old-refresh");
    }

    #[tokio::test]
    async fn test_refresh_primary_invalid_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(token_path()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70008: The refresh token has expired"
            })))
            .mount(&server)
            .await;

        let err = authenticator_for(&server)
            .refresh_primary("old-refresh")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PrimaryRefreshError::InvalidGrant { description } if description.contains("AADSTS70008")
        ));
    }
}
