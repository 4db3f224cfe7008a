use crate::config::{env_parse_or, env_string};
use crate::queue::delay::DEFAULT_MAX_DELAY_PER_CYCLE_SECONDS;
use crate::{Error, Result};
use serde::Serialize;
use std::time::Duration;

/// Largest batch a single receive call may ask for (SQS limit).
pub const MAX_RECEIVE_BATCH: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    /// Only needed by network queue backends.
    pub primary_queue_url: Option<String>,
    pub delay_queue_url: Option<String>,

    pub max_concurrency: usize,
    pub receive_batch_size: usize,
    /// Sleep between receive attempts while every slot is taken.
    pub busy_poll_interval: Duration,
    pub receive_wait: Duration,
    pub visibility_timeout: Duration,
    pub drain_poll_interval: Duration,

    pub max_delay_per_cycle_seconds: u64,
    /// Added on top of a rate limit's reset time before the job is retried.
    pub rate_limit_padding_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            primary_queue_url: None,
            delay_queue_url: None,
            max_concurrency: 4,
            receive_batch_size: MAX_RECEIVE_BATCH,
            busy_poll_interval: Duration::from_millis(200),
            receive_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_secs(1),
            max_delay_per_cycle_seconds: DEFAULT_MAX_DELAY_PER_CYCLE_SECONDS,
            rate_limit_padding_seconds: 30,
        }
    }
}

impl WorkerConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            primary_queue_url: env_string("TRIBUTARY_PRIMARY_QUEUE_URL"),
            delay_queue_url: env_string("TRIBUTARY_DELAY_QUEUE_URL"),
            max_concurrency: env_parse_or("TRIBUTARY_MAX_CONCURRENCY", d.max_concurrency)?,
            receive_batch_size: d.receive_batch_size,
            busy_poll_interval: Duration::from_millis(env_parse_or(
                "TRIBUTARY_BUSY_POLL_MS",
                d.busy_poll_interval.as_millis() as u64,
            )?),
            receive_wait: Duration::from_secs(env_parse_or(
                "TRIBUTARY_RECEIVE_WAIT_SECONDS",
                d.receive_wait.as_secs(),
            )?),
            visibility_timeout: Duration::from_secs(env_parse_or(
                "TRIBUTARY_VISIBILITY_TIMEOUT_SECONDS",
                d.visibility_timeout.as_secs(),
            )?),
            drain_poll_interval: Duration::from_millis(env_parse_or(
                "TRIBUTARY_DRAIN_POLL_MS",
                d.drain_poll_interval.as_millis() as u64,
            )?),
            max_delay_per_cycle_seconds: env_parse_or(
                "TRIBUTARY_MAX_DELAY_PER_CYCLE_SECONDS",
                d.max_delay_per_cycle_seconds,
            )?,
            rate_limit_padding_seconds: env_parse_or(
                "TRIBUTARY_RATE_LIMIT_PADDING_SECONDS",
                d.rate_limit_padding_seconds,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::InvalidInput("max_concurrency must be > 0".to_string()));
        }
        if self.receive_batch_size == 0 || self.receive_batch_size > MAX_RECEIVE_BATCH {
            return Err(Error::InvalidInput(format!(
                "receive_batch_size must be within 1..={MAX_RECEIVE_BATCH}"
            )));
        }
        if self.busy_poll_interval.is_zero() {
            return Err(Error::InvalidInput(
                "busy_poll_interval must be > 0".to_string(),
            ));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(Error::InvalidInput(
                "drain_poll_interval must be > 0".to_string(),
            ));
        }
        if self.receive_wait > Duration::from_secs(20) {
            return Err(Error::InvalidInput(
                "receive_wait must be <= 20 seconds".to_string(),
            ));
        }
        if self.max_delay_per_cycle_seconds == 0
            || self.max_delay_per_cycle_seconds > DEFAULT_MAX_DELAY_PER_CYCLE_SECONDS
        {
            return Err(Error::InvalidInput(format!(
                "max_delay_per_cycle_seconds must be within 1..={DEFAULT_MAX_DELAY_PER_CYCLE_SECONDS}"
            )));
        }
        Ok(())
    }

    /// Slots to request on the next receive, given how many are taken.
    pub fn receive_count(&self, in_flight: usize) -> usize {
        self.max_concurrency
            .saturating_sub(in_flight)
            .min(self.receive_batch_size)
    }
}
