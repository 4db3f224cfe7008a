//! Delivery delays longer than the transport's native maximum.
//!
//! A delayed message sits on the delay queue carrying how much delay it still
//! owes. Every pass through the delay queue serves at most `max_delay_per_cycle`
//! seconds; once nothing is owed the message moves to its target queue.

use std::sync::Arc;

use super::{MessageAttributes, OutgoingMessage, QueueBackend, QueueMessage, QueueName};
use crate::models::TenantId;
use crate::worker::message::WorkerMessage;
use crate::{Error, Result};

/// SQS caps native delivery delay at 15 minutes.
pub const DEFAULT_MAX_DELAY_PER_CYCLE_SECONDS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayHop {
    /// Put the message back on the delay queue.
    Redelay { remaining: u64, native_delay: u64 },
    /// Delay served; deliver to `target`.
    Forward { target: QueueName },
}

/// Decide what to do with a message just received from the delay queue.
///
/// The native delay it was sent with has elapsed, so one cycle is deducted.
pub fn next_hop(attributes: &MessageAttributes, max_delay_per_cycle: u64) -> DelayHop {
    let owed = attributes.remaining_delay_seconds.unwrap_or(0);
    let remaining = owed.saturating_sub(max_delay_per_cycle);
    if remaining > 0 {
        DelayHop::Redelay {
            remaining,
            native_delay: remaining.min(max_delay_per_cycle),
        }
    } else {
        DelayHop::Forward {
            target: attributes.target_queue.unwrap_or(QueueName::Primary),
        }
    }
}

/// Sends worker messages, routing anything delayed through the delay queue.
#[derive(Clone)]
pub struct JobEmitter {
    queue: Arc<dyn QueueBackend>,
    max_delay_per_cycle: u64,
}

impl JobEmitter {
    pub fn new(queue: Arc<dyn QueueBackend>, max_delay_per_cycle: u64) -> Self {
        Self {
            queue,
            max_delay_per_cycle,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, message), fields(kind = message.kind()))]
    pub async fn send(
        &self,
        tenant_id: TenantId,
        message: &WorkerMessage,
        delay_seconds: u64,
    ) -> Result<String> {
        let body = serde_json::to_string(message)
            .map_err(|e| Error::backend("serialize worker message", e))?;
        let mut out = OutgoingMessage::new(body);
        out.attributes.tenant_id = Some(tenant_id.to_string());

        if delay_seconds == 0 {
            return self.queue.send(QueueName::Primary, out).await;
        }

        out.delay_seconds = delay_seconds.min(self.max_delay_per_cycle);
        out.attributes.remaining_delay_seconds = Some(delay_seconds);
        out.attributes.target_queue = Some(QueueName::Primary);
        tracing::debug!(
            delay_seconds,
            native_delay = out.delay_seconds,
            "sending message through delay queue"
        );
        self.queue.send(QueueName::Delay, out).await
    }
}

/// Consumes the delay queue, re-delaying or forwarding each message.
#[derive(Clone)]
pub struct DelayForwarder {
    queue: Arc<dyn QueueBackend>,
    max_delay_per_cycle: u64,
}

impl DelayForwarder {
    pub fn new(queue: Arc<dyn QueueBackend>, max_delay_per_cycle: u64) -> Self {
        Self {
            queue,
            max_delay_per_cycle,
        }
    }

    /// Route one received delay-queue message, then delete it.
    #[tracing::instrument(level = "debug", skip_all, fields(message_id = %message.message_id))]
    pub async fn forward(&self, message: &QueueMessage) -> Result<DelayHop> {
        let hop = next_hop(&message.attributes, self.max_delay_per_cycle);
        let mut out = OutgoingMessage::new(message.body.clone());
        out.attributes.tenant_id = message.attributes.tenant_id.clone();

        match hop {
            DelayHop::Redelay {
                remaining,
                native_delay,
            } => {
                out.delay_seconds = native_delay;
                out.attributes.remaining_delay_seconds = Some(remaining);
                out.attributes.target_queue = message.attributes.target_queue;
                tracing::debug!(remaining, "message still delayed");
                self.queue.send(QueueName::Delay, out).await?;
            }
            DelayHop::Forward { target } => {
                tracing::debug!(%target, "delay served, forwarding message");
                self.queue.send(target, out).await?;
            }
        }

        self.queue
            .delete(QueueName::Delay, &message.receipt)
            .await?;
        Ok(hop)
    }
}
