use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// A platform told us to slow down.
///
/// Carries the number of seconds until the platform's quota resets and the
/// endpoint that tripped it. The worker turns this into a delayed re-delivery
/// of the whole job. `resume` is filled in by the scheduler with the work
/// left over, so the re-delivered job picks up where this one stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitError {
    pub reset_seconds: u64,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<serde_json::Value>,
}

impl RateLimitError {
    pub fn new(reset_seconds: u64, endpoint: impl Into<String>) -> Self {
        Self {
            reset_seconds,
            endpoint: endpoint.into(),
            resume: None,
        }
    }

    pub fn with_resume(mut self, resume: serde_json::Value) -> Self {
        self.resume = Some(resume);
        self
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate limited on {} (resets in {}s)",
            self.endpoint, self.reset_seconds
        )
    }
}

/// Common error type for `tributary_core`.
///
/// Connector and backend implementations should preserve the underlying error
/// chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials were rejected or revoked by the platform.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    RateLimited(RateLimitError),

    /// The connector cannot continue this integration at all (unknown stream
    /// kind, channel vanished from pipeline data, ...).
    #[error("fatal connector error: {0}")]
    Fatal(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort the job and re-deliver it after the reset delay.
    RateLimit { reset_seconds: u64 },
    /// Abort the whole job; the integration is marked errored.
    Job,
    /// Abort the current stream lineage; the job goes on.
    Stream,
    /// Skip a single record.
    Record,
}

impl Error {
    #[tracing::instrument(level = "debug", name = "tributary.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    pub fn rate_limited(reset_seconds: u64, endpoint: impl Into<String>) -> Self {
        Self::RateLimited(RateLimitError::new(reset_seconds, endpoint))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited(e) => ErrorClass::RateLimit {
                reset_seconds: e.reset_seconds,
            },
            Self::Backend { .. } | Self::BackendMessage(_) => ErrorClass::Stream,
            Self::MalformedRecord(_) => ErrorClass::Record,
            Self::InvalidInput(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::Unauthorized(_)
            | Self::Fatal(_) => ErrorClass::Job,
        }
    }

    pub fn as_rate_limit(&self) -> Option<&RateLimitError> {
        match self {
            Self::RateLimited(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
