use std::time::Duration;

use url::Url;

use crate::errors::{AuthError, Result};

/// Default provider endpoints
pub mod endpoints {
    pub const MS_DEVICE_CODE: &str =
        "https://login.microsoftonline.com/consumers/oauth2/v2.0/devicecode";
    pub const MS_TOKEN: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
    pub const XBL_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
    pub const MC_LOGIN: &str = "https://api.minecraftservices.com/authentication/login_with_xbox";
    pub const MC_PROFILE: &str = "https://api.minecraftservices.com/minecraft/profile";
}

/// OAuth scope requested for device-code and refresh grants
pub const DEVICE_FLOW_SCOPE: &str = "XboxLive.signin offline_access";

/// Relying parties
pub const RP_XBOXLIVE_AUTH: &str = "http://auth.xboxlive.com";
pub const RP_MINECRAFT: &str = "rp://api.minecraftservices.com/";

/// Prefix of the identity token sent to Minecraft Services
pub const IDENTITY_TOKEN_SCHEME: &str = "XBL3.0";

/// Safety window subtracted from every expiry instant
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(5);

/// Resolved URLs for every provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub device_code: Url,
    pub token: Url,
    pub xbl_authenticate: Url,
    pub xsts_authorize: Url,
    pub mc_login: Url,
    pub mc_profile: Url,
}

impl Endpoints {
    /// Point every endpoint at one base URL, keeping the production paths.
    ///
    /// Mostly useful for pointing the engine at a mock server.
    pub fn with_base(base: &Url) -> Result<Self> {
        let rebase = |raw: &str| -> Result<Url> {
            let path = Url::parse(raw)?.path().to_string();
            Ok(base.join(&path)?)
        };

        Ok(Self {
            device_code: rebase(endpoints::MS_DEVICE_CODE)?,
            token: rebase(endpoints::MS_TOKEN)?,
            xbl_authenticate: rebase(endpoints::XBL_AUTHENTICATE)?,
            xsts_authorize: rebase(endpoints::XSTS_AUTHORIZE)?,
            mc_login: rebase(endpoints::MC_LOGIN)?,
            mc_profile: rebase(endpoints::MC_PROFILE)?,
        })
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        let parse = |raw: &str| Url::parse(raw).expect("valid built-in endpoint");
        Self {
            device_code: parse(endpoints::MS_DEVICE_CODE),
            token: parse(endpoints::MS_TOKEN),
            xbl_authenticate: parse(endpoints::XBL_AUTHENTICATE),
            xsts_authorize: parse(endpoints::XSTS_AUTHORIZE),
            mc_login: parse(endpoints::MC_LOGIN),
            mc_profile: parse(endpoints::MC_PROFILE),
        }
    }
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        AuthError::InvalidConfig(format!("bad endpoint URL: {err}"))
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(5),
        }
    }
}

/// Configuration shared by every engine component
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Azure application (client) ID registered for the device-code flow
    pub client_id: String,

    pub endpoints: Endpoints,

    /// HTTP client timeouts, applied per call
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    pub expiry_margin: Duration,
}

impl AuthConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("pearlkeeper".to_string()),
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_timeouts(mut self, http_timeouts: HttpTimeouts) -> Self {
        self.http_timeouts = http_timeouts;
        self
    }

    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Build the HTTP client every component of one engine shares
    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig("client_id is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(self.http_timeouts.connect)
            .timeout(self.http_timeouts.request)
            .user_agent(self.user_agent.as_deref().unwrap_or("pearlkeeper"))
            .build()?;
        Ok(client)
    }
}
