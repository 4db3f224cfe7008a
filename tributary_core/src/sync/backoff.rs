//! Per-call rate-limit decisions shared by connectors.
//!
//! Connectors read quota hints off each response and turn them into
//! `Error::RateLimited` before the platform starts rejecting calls. The worker
//! owns the actual waiting (delayed re-delivery), never the connector.

use crate::{Error, Result};

/// Used when a platform rejects a call without saying when to come back.
pub const DEFAULT_RESET_SECONDS: u64 = 60;

/// Quota hints from one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Calls left in the current window, if reported.
    pub remaining: Option<u64>,
    /// Seconds until the window resets, if reported.
    pub reset_seconds: Option<u64>,
}

impl RateLimitInfo {
    /// Seconds to pause before the next call, when the quota is spent
    /// (at most one call left).
    pub fn pause_seconds(&self) -> Option<u64> {
        match self.remaining {
            Some(remaining) if remaining <= 1 => {
                Some(self.reset_seconds.unwrap_or(DEFAULT_RESET_SECONDS))
            }
            _ => None,
        }
    }

    /// Fail with `RateLimited` when the quota is spent.
    pub fn check(&self, endpoint: &str) -> Result<()> {
        match self.pause_seconds() {
            Some(secs) => Err(Error::rate_limited(secs, endpoint)),
            None => Ok(()),
        }
    }
}

/// Parse a `Retry-After` value given in seconds. HTTP-date values are not
/// used by the platforms we talk to and fall back to the default.
pub fn parse_retry_after(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RESET_SECONDS)
}

/// Map an HTTP status to a rate-limit error (429 only).
pub fn rate_limit_from_status(status: u16, retry_after: Option<&str>, endpoint: &str) -> Option<Error> {
    (status == 429).then(|| Error::rate_limited(parse_retry_after(retry_after), endpoint))
}

/// Delay before a rate-limited job is re-delivered.
pub fn redelivery_delay_seconds(reset_seconds: u64, padding_seconds: u64) -> u64 {
    reset_seconds.saturating_add(padding_seconds)
}
