use std::fmt;

use thiserror::Error;

/// Credential engine error types
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("User declined the authorization request")]
    UserDeclined,

    #[error("Device code session expired before the user finished signing in")]
    SessionExpired,

    #[error("OAuth invalid_grant: {description}")]
    InvalidGrant { description: String },

    #[error("Unrecognized identity provider error (HTTP {status}): {body_snippet}")]
    UnknownProviderError {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("Unexpected HTTP status {status}: {body_snippet}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("Primary token refresh failed: {0}")]
    PrimaryRefresh(#[from] PrimaryRefreshError),

    #[error("No cached credentials for account '{label}'")]
    NotFound { label: String },

    #[error("Credential storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cached credentials for account '{label}' are unreadable: {reason}")]
    CorruptCache { label: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Device code polling was cancelled")]
    Cancelled,

    #[error("The {token} token is still inside the expiry margin after refreshing")]
    TokenStillExpired { token: TokenKind },

    #[error("Background task aborted: {0}")]
    TaskAborted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Which of the two independently expiring tokens an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Primary,
    Game,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Game => f.write_str("game"),
        }
    }
}

/// Stage of the token exchange chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStage {
    Xbl,
    Xsts,
    GameService,
    Profile,
}

impl fmt::Display for ExchangeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xbl => f.write_str("XBL"),
            Self::Xsts => f.write_str("XSTS"),
            Self::GameService => f.write_str("GameService"),
            Self::Profile => f.write_str("Profile"),
        }
    }
}

/// A failed stage of the exchange chain
#[derive(Error, Debug)]
#[error("{stage} exchange failed: {reason}")]
pub struct ExchangeError {
    pub stage: ExchangeStage,
    #[source]
    pub reason: ExchangeFailure,
}

impl ExchangeError {
    pub fn new(stage: ExchangeStage, reason: ExchangeFailure) -> Self {
        Self { stage, reason }
    }
}

#[derive(Error, Debug)]
pub enum ExchangeFailure {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body_snippet}")]
    Status {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("response is missing '{0}'")]
    MissingField(&'static str),

    #[error("response has no DisplayClaims.xui list")]
    MissingClaims,

    #[error("DisplayClaims.xui list is empty")]
    EmptyClaims,

    #[error("first xui claim has no user hash")]
    MissingHash,

    #[error("authorization denied: {0}")]
    Denied(XstsDenial),

    #[error("Minecraft profile not found - the account may not own the game")]
    ProfileNotFound,
}

/// XSTS-specific error codes from the XErr field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsDenial {
    #[error("Account doesn't have an Xbox account (XErr: 2148916233)")]
    NoXboxAccount,

    #[error("Xbox Live not available in this country (XErr: 2148916235)")]
    RegionNotSupported,

    #[error("Adult verification required on Xbox page (XErr: 2148916236/2148916237)")]
    AdultVerificationRequired,

    #[error("Child account requires Family (XErr: 2148916238)")]
    ChildAccountRequiresFamily,

    #[error("Unknown XSTS error code: {0}")]
    Unknown(u64),
}

impl XstsDenial {
    /// Parse XErr code from XSTS response
    pub fn from_xerr(code: u64) -> Self {
        match code {
            2148916233 => Self::NoXboxAccount,
            2148916235 => Self::RegionNotSupported,
            2148916236 | 2148916237 => Self::AdultVerificationRequired,
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown(code),
        }
    }
}

/// Failure of the refresh_token grant
#[derive(Error, Debug)]
pub enum PrimaryRefreshError {
    #[error("refresh token rejected: {description}")]
    InvalidGrant { description: String },

    #[error("HTTP {status}: {body_snippet}")]
    Status {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed response body: {0}")]
    MalformedBody(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// First 200 characters of a response body, for error messages
pub(crate) fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
