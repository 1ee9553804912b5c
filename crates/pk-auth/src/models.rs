//! Wire schemas for every provider call.
//!
//! Response fields the engine depends on are `Option`s so that a missing field
//! surfaces as a typed engine error instead of a generic decode failure.

use serde::{Deserialize, Serialize};

/// Device authorization response
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: Option<String>,
    pub user_code: Option<String>,
    pub verification_uri: Option<String>,
    pub expires_in: Option<u64>,
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Token endpoint response, from both the device_code and refresh_token grants
#[derive(Debug, Clone, Deserialize)]
pub struct MsTokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Token endpoint error body
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Xbox Live user.authenticate request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthRequest {
    pub properties: XblAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthProperties {
    pub auth_method: String,
    pub site_name: String,
    pub rps_ticket: String,
}

/// Xbox Live user.authenticate response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XblAuthResponse {
    pub token: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
}

/// XSTS authorize request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthRequest {
    pub properties: XstsAuthProperties,
    pub relying_party: String,
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthProperties {
    pub sandbox_id: String,
    pub user_tokens: Vec<String>,
}

/// XSTS authorize response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsAuthResponse {
    pub token: Option<String>,
    pub display_claims: Option<DisplayClaims>,
    #[serde(default)]
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayClaims {
    pub xui: Option<Vec<UserClaim>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserClaim {
    pub uhs: Option<String>,
}

/// XSTS error response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct XstsErrorResponse {
    #[serde(rename = "XErr")]
    pub xerr: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Minecraft login_with_xbox request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McLoginRequest {
    pub identity_token: String,
}

/// Minecraft login_with_xbox response
#[derive(Debug, Clone, Deserialize)]
pub struct McLoginResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Minecraft profile response
#[derive(Debug, Clone, Deserialize)]
pub struct McProfileResponse {
    /// UUID without dashes
    pub id: Option<String>,
    pub name: Option<String>,
}
