//! Lock record data model
//!
//! The record is the whole content of the lock object. It is stored as a
//! small JSON document:
//!
//! ```json
//! {"id":"2b0c7f1e-...","expires":"2026-10-19T08:00:05.123Z","fence":42}
//! ```
//!
//! `id` and `expires` are omitted while the lock is unheld; `fence` is omitted
//! only until the first acquisition and is never reset afterwards.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Errors raised while reading or mutating a lock record
#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("malformed lock record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("fencing token space exhausted")]
    FenceExhausted,

    #[error("lease expiry is out of the representable time range")]
    ExpiryOutOfRange,
}

/// Fencing token issued for one successful acquisition.
///
/// Tokens strictly increase across acquisitions of the same lock object.
/// Downstream systems should reject writes carrying a token lower than the
/// highest one they have already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<FencingToken> for u64 {
    fn from(token: FencingToken) -> Self {
        token.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted lock state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Identity of the current holder
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    /// Absolute lease expiry (UTC)
    #[serde(rename = "expires", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Last issued fencing token (0 = never acquired)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fence: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Absolute expiry of a lease starting at `now`
pub fn expiry(now: DateTime<Utc>, lease: TimeDelta) -> Result<DateTime<Utc>, RecordError> {
    now.checked_add_signed(lease)
        .ok_or(RecordError::ExpiryOutOfRange)
}

impl LockRecord {
    /// Decode stored bytes; an absent or empty object is an unheld record with fence 0
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn has_holder(&self) -> bool {
        self.holder.as_deref().is_some_and(|holder| !holder.is_empty())
    }

    /// Held iff a holder is recorded and its lease runs past `now`
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.has_holder() && self.expires_at.is_some_and(|expires_at| expires_at > now)
    }

    /// A holder is still recorded but its lease has run out.
    /// Such a record is acquirable; it is never cleaned up in the background.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.has_holder() && !self.is_held_at(now)
    }

    /// Check if `identity` holds the lock at `now`
    pub fn is_held_by(&self, identity: &str, now: DateTime<Utc>) -> bool {
        self.is_held_at(now) && self.holder.as_deref() == Some(identity)
    }

    /// Lease time left at `now`
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.expires_at {
            Some(expires_at) if self.is_held_at(now) => {
                (expires_at - now).to_std().unwrap_or_default()
            }
            _ => Duration::ZERO,
        }
    }

    /// Take the lock for `holder` and issue the next fencing token.
    ///
    /// Callers must check [`is_held_at`](Self::is_held_at) first; this method
    /// does not refuse a held record.
    pub fn acquire(
        &mut self,
        holder: impl Into<String>,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<FencingToken, RecordError> {
        let fence = self.fence.checked_add(1).ok_or(RecordError::FenceExhausted)?;
        let expires_at = expiry(now, lease)?;
        self.holder = Some(holder.into());
        self.expires_at = Some(expires_at);
        self.fence = fence;
        Ok(FencingToken(fence))
    }

    /// Push the expiry of the current hold to `now + lease`. The fence is unchanged.
    pub fn extend(&mut self, now: DateTime<Utc>, lease: TimeDelta) -> Result<(), RecordError> {
        self.expires_at = Some(expiry(now, lease)?);
        Ok(())
    }

    /// Clear holder and expiry. The fence is never reset.
    pub fn release(&mut self) {
        self.holder = None;
        self.expires_at = None;
    }
}
