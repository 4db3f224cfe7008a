//! Retrospective window: how far back an already-known stream keeps paging.
//!
//! Brand-new sources are walked to the end exactly once. Known sources stop as
//! soon as a page reaches data older than the window, since a previous run
//! already synchronized it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETROSPECT_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrospectPolicy {
    pub max_retrospect_seconds: u64,
}

impl Default for RetrospectPolicy {
    fn default() -> Self {
        Self {
            max_retrospect_seconds: DEFAULT_MAX_RETROSPECT_SECONDS,
        }
    }
}

impl RetrospectPolicy {
    pub fn new(max_retrospect_seconds: u64) -> Self {
        Self {
            max_retrospect_seconds,
        }
    }

    /// True when `last_record_timestamp` lies more than the window before the
    /// job start.
    pub fn is_retrospect_over(
        &self,
        last_record_timestamp: DateTime<Utc>,
        start_timestamp: DateTime<Utc>,
    ) -> bool {
        let gap = start_timestamp.signed_duration_since(last_record_timestamp);
        gap.num_seconds() > self.max_retrospect_seconds as i64
    }

    /// Stopping rule for a stream that has another page available.
    pub fn is_stream_finished(
        &self,
        start_timestamp: DateTime<Utc>,
        is_new: bool,
        last_record_timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        if is_new {
            return false;
        }
        match last_record_timestamp {
            None => true,
            Some(last) => self.is_retrospect_over(last, start_timestamp),
        }
    }
}
