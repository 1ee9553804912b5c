use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::DEFAULT_EXPIRY_MARGIN;
use crate::record::CredentialRecord;

/// Decides whether a token is too close to its expiry instant to be used.
///
/// A token counts as expired once `now >= expires_at - margin`, so a request
/// started just before the deadline cannot carry a token that dies mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    margin: TimeDelta,
}

impl ExpiryPolicy {
    pub fn new(margin: Duration) -> Self {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::seconds(5));
        Self { margin }
    }

    pub fn margin(&self) -> TimeDelta {
        self.margin
    }

    pub fn is_expired(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match expires_at.checked_sub_signed(self.margin) {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    /// Time left before the token counts as expired, `None` once it does
    pub fn remaining(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<TimeDelta> {
        if self.is_expired(expires_at, now) {
            return None;
        }
        Some(expires_at - self.margin - now)
    }

    /// Both the primary and the game token are usable
    pub fn is_fully_valid(&self, record: &CredentialRecord, now: DateTime<Utc>) -> bool {
        !self.is_expired(record.primary.expires_at, now)
            && !self.is_expired(record.game.expires_at, now)
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY_MARGIN)
    }
}

/// Absolute expiry instant for a lifetime declared by a provider
pub fn expires_after(acquired_at: DateTime<Utc>, expires_in_secs: u64) -> DateTime<Utc> {
    i64::try_from(expires_in_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|lifetime| acquired_at.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
