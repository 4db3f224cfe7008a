//! Durable queue transport used by the worker runtime.
//!
//! Two logical queues are involved: `Primary` holds ready-to-run jobs,
//! `Delay` holds jobs scheduled further out than the transport's native
//! delivery delay allows (see `delay`).

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod delay;
pub mod memory;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Primary,
    Delay,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Delay => "delay",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "primary" => Ok(Self::Primary),
            "delay" => Ok(Self::Delay),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown queue name: {other}"
            ))),
        }
    }
}

/// Attributes travelling next to the body (not inside it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttributes {
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Delay still owed to the message when it sits on the delay queue.
    #[serde(default)]
    pub remaining_delay_seconds: Option<u64>,
    /// Where the delay queue forwards the message once the delay is served.
    #[serde(default)]
    pub target_queue: Option<QueueName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    /// Native delivery delay requested from the transport.
    pub delay_seconds: u64,
    pub attributes: MessageAttributes,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            delay_seconds: 0,
            attributes: MessageAttributes::default(),
        }
    }
}

/// A message handed out by `receive`. The receipt is required to delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    pub attributes: MessageAttributes,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a message; returns the transport's message id.
    async fn send(&self, queue: QueueName, message: OutgoingMessage) -> Result<String>;

    /// Receive up to `max` messages, long-polling as configured by the backend.
    async fn receive(&self, queue: QueueName, max: usize) -> Result<Vec<QueueMessage>>;

    /// Remove a received message for good.
    async fn delete(&self, queue: QueueName, receipt: &str) -> Result<()>;
}
