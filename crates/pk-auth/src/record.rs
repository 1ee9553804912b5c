use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expiry::expires_after;

/// Everything cached for one managed account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRecord {
    pub primary: PrimaryToken,
    pub game: GameToken,
    pub identity: Identity,
}

/// Microsoft OAuth tokens
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrimaryToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl PrimaryToken {
    pub fn issued(
        access_token: String,
        refresh_token: String,
        expires_in: u64,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_after(acquired_at, expires_in),
        }
    }
}

impl fmt::Debug for PrimaryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Minecraft Services access token
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl GameToken {
    pub fn issued(token: String, expires_in: u64, acquired_at: DateTime<Utc>) -> Self {
        Self {
            token,
            expires_at: expires_after(acquired_at, expires_in),
        }
    }
}

impl fmt::Debug for GameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Minecraft profile identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// UUID without dashes
    pub unique_id: String,
    pub display_name: String,
}

/// Key naming one managed account's credential record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountLabel(String);

impl AccountLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name stem for this label.
    ///
    /// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so every label maps
    /// to one path component and the mapping is reversible.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
                stem.push(byte as char);
            } else {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
        stem
    }

    /// Inverse of [`AccountLabel::file_stem`]
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let bytes = stem.as_bytes();
        let mut decoded = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = stem.get(i + 1..i + 3)?;
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(decoded).ok().map(Self)
    }
}

impl fmt::Display for AccountLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for AccountLabel {
    fn from(label: String) -> Self {
        Self(label)
    }
}
