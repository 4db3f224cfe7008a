//! Process-wide tracing setup.
//!
//! `RUST_LOG` controls filtering (default `info`). Output is JSON lines unless
//! `TRIBUTARY_LOG_FORMAT=text`.

use crate::config::env_string;
use crate::{Error, Result};
use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(Error::InvalidInput(format!("invalid log format: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct O11yConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl Default for O11yConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: "info".to_string(),
        }
    }
}

impl O11yConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_string("TRIBUTARY_LOG_FORMAT") {
            cfg.format = v.parse()?;
        }
        Ok(cfg)
    }
}

pub fn init_global_from_env() -> Result<()> {
    init_global(O11yConfig::from_env()?)
}

pub fn init_global(cfg: O11yConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.default_filter.as_str()));

    let fmt = match cfg.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" text ".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn second_init_is_a_conflict() {
        // Whichever call wins, the other must report the conflict.
        let a = init_global(O11yConfig::default());
        let b = init_global(O11yConfig::default());
        assert!(a.is_err() || b.is_err());
        assert!(matches!(b, Err(Error::Conflict(_))));
    }
}
