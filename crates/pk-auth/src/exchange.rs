use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::{AuthConfig, Endpoints, IDENTITY_TOKEN_SCHEME, RP_MINECRAFT, RP_XBOXLIVE_AUTH};
use crate::errors::{snippet, ExchangeError, ExchangeFailure, ExchangeStage, Result, XstsDenial};
use crate::models::*;
use crate::record::{GameToken, Identity};

type StageResult<T> = std::result::Result<T, ExchangeError>;

/// XSTS authorization for Minecraft Services
#[derive(Clone, PartialEq, Eq)]
pub struct XstsToken {
    pub token: String,
    pub user_hash: String,
}

impl XstsToken {
    /// Identity token expected by `login_with_xbox`
    pub fn identity_token(&self) -> String {
        format!("{} x={};{}", IDENTITY_TOKEN_SCHEME, self.user_hash, self.token)
    }
}

impl std::fmt::Debug for XstsToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XstsToken")
            .field("token", &"[REDACTED]")
            .field("user_hash", &self.user_hash)
            .finish()
    }
}

/// What a full run of the chain produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutput {
    pub game: GameToken,
    pub identity: Identity,
}

/// Turns a Microsoft access token into a Minecraft token and profile.
///
/// Stages run strictly in order (XBL → XSTS → GameService → Profile), each a
/// single request, and the first failure ends the run.
#[derive(Debug, Clone)]
pub struct TokenExchangeChain {
    http: Client,
    endpoints: Endpoints,
}

impl TokenExchangeChain {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        Ok(Self::with_client(config.http_client()?, config.endpoints.clone()))
    }

    pub(crate) fn with_client(http: Client, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    /// Authenticate with Xbox Live
    #[instrument(skip_all)]
    pub async fn exchange_xbl(&self, primary_access_token: &str) -> StageResult<String> {
        const STAGE: ExchangeStage = ExchangeStage::Xbl;

        let request = XblAuthRequest {
            properties: XblAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("d={}", primary_access_token),
            },
            relying_party: RP_XBOXLIVE_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authenticating with Xbox Live");
        let response = self
            .http
            .post(self.endpoints.xbl_authenticate.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| stage_error(STAGE, e.into()))?;

        let body: XblAuthResponse = read_success(STAGE, response).await?;
        non_empty(body.token).ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingField("Token")))
    }

    /// Authorize with XSTS for the Minecraft relying party
    #[instrument(skip_all)]
    pub async fn exchange_xsts(&self, xbl_ticket: &str) -> StageResult<XstsToken> {
        const STAGE: ExchangeStage = ExchangeStage::Xsts;

        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![xbl_ticket.to_string()],
            },
            relying_party: RP_MINECRAFT.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authorizing with XSTS");
        let response = self
            .http
            .post(self.endpoints.xsts_authorize.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| stage_error(STAGE, e.into()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| stage_error(STAGE, e.into()))?;
            let reason = match serde_json::from_str::<XstsErrorResponse>(&text) {
                Ok(denied) => {
                    warn!("XSTS denied authorization with XErr {}", denied.xerr);
                    ExchangeFailure::Denied(XstsDenial::from_xerr(denied.xerr))
                }
                Err(_) => ExchangeFailure::Status {
                    status,
                    body_snippet: snippet(&text),
                },
            };
            return Err(stage_error(STAGE, reason));
        }

        let body: XstsAuthResponse = read_success(STAGE, response).await?;
        let token = non_empty(body.token)
            .ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingField("Token")))?;
        let claims = body
            .display_claims
            .and_then(|claims| claims.xui)
            .ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingClaims))?;
        let first = claims
            .into_iter()
            .next()
            .ok_or_else(|| stage_error(STAGE, ExchangeFailure::EmptyClaims))?;
        let user_hash =
            non_empty(first.uhs).ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingHash))?;

        Ok(XstsToken { token, user_hash })
    }

    /// Login to Minecraft Services with an XSTS token
    #[instrument(skip_all)]
    pub async fn exchange_game_token(&self, xsts: &XstsToken) -> StageResult<GameToken> {
        const STAGE: ExchangeStage = ExchangeStage::GameService;

        let request = McLoginRequest {
            identity_token: xsts.identity_token(),
        };

        debug!("Logging in to Minecraft Services");
        let acquired_at = Utc::now();
        let response = self
            .http
            .post(self.endpoints.mc_login.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| stage_error(STAGE, e.into()))?;

        let body: McLoginResponse = read_success(STAGE, response).await?;
        let token = non_empty(body.access_token)
            .ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingField("access_token")))?;
        let expires_in = body
            .expires_in
            .ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingField("expires_in")))?;

        Ok(GameToken::issued(token, expires_in, acquired_at))
    }

    /// Fetch the Minecraft profile owning a game token
    #[instrument(skip_all)]
    pub async fn fetch_profile(&self, game_token: &str) -> StageResult<Identity> {
        const STAGE: ExchangeStage = ExchangeStage::Profile;

        debug!("Fetching Minecraft profile");
        let response = self
            .http
            .get(self.endpoints.mc_profile.clone())
            .bearer_auth(game_token)
            .send()
            .await
            .map_err(|e| stage_error(STAGE, e.into()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(stage_error(STAGE, ExchangeFailure::ProfileNotFound));
        }

        let body: McProfileResponse = read_success(STAGE, response).await?;
        let unique_id =
            non_empty(body.id).ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingField("id")))?;
        let display_name = non_empty(body.name)
            .ok_or_else(|| stage_error(STAGE, ExchangeFailure::MissingField("name")))?;

        Ok(Identity {
            unique_id,
            display_name,
        })
    }

    /// Run all four stages in order, stopping at the first failure
    #[instrument(skip_all)]
    pub async fn run_full_chain(&self, primary_access_token: &str) -> StageResult<ChainOutput> {
        let ticket = self.exchange_xbl(primary_access_token).await?;
        debug!("Authorized on XBL");

        let xsts = self.exchange_xsts(&ticket).await?;
        debug!("Got XSTS token");

        let game = self.exchange_game_token(&xsts).await?;
        debug!("Got Minecraft token");

        let identity = self.fetch_profile(&game.token).await?;
        debug!(name = %identity.display_name, "Got Minecraft profile");

        Ok(ChainOutput { game, identity })
    }
}

fn stage_error(stage: ExchangeStage, reason: ExchangeFailure) -> ExchangeError {
    ExchangeError::new(stage, reason)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Check for a success status and decode the body as `T`
async fn read_success<T: DeserializeOwned>(
    stage: ExchangeStage,
    response: Response,
) -> StageResult<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| stage_error(stage, e.into()))?;

    if !status.is_success() {
        return Err(stage_error(
            stage,
            ExchangeFailure::Status {
                status,
                body_snippet: snippet(&text),
            },
        ));
    }

    serde_json::from_str(&text)
        .map_err(|e| stage_error(stage, ExchangeFailure::MalformedBody(e.to_string())))
}
