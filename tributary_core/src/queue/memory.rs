use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{MessageAttributes, OutgoingMessage, QueueBackend, QueueMessage, QueueName};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: MessageAttributes,
    visible_at: Instant,
    receipt: Option<String>,
}

/// In-memory queue for local development and tests.
///
/// Semantics mirror a visibility-timeout queue: received messages are hidden
/// until deleted or until the visibility timeout lapses, and native delays
/// hide a message until they expire.
#[derive(Clone)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<QueueName, Vec<StoredMessage>>>>,
    receive_calls: Arc<Mutex<HashMap<QueueName, usize>>>,
    sent: Arc<AtomicUsize>,
    wait_time: Duration,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(20), Duration::from_secs(30))
    }
}

impl MemoryQueue {
    pub fn new(wait_time: Duration, visibility_timeout: Duration) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            receive_calls: Arc::new(Mutex::new(HashMap::new())),
            sent: Arc::new(AtomicUsize::new(0)),
            wait_time,
            visibility_timeout,
            poll_interval: Duration::from_millis(5),
        }
    }

    /// Messages still held by `queue`, received or not.
    pub async fn len(&self, queue: QueueName) -> usize {
        self.queues
            .lock()
            .await
            .get(&queue)
            .map_or(0, |msgs| msgs.len())
    }

    /// Bodies and attributes currently held by `queue` (primarily for tests).
    pub async fn peek(&self, queue: QueueName) -> Vec<(String, MessageAttributes)> {
        self.queues
            .lock()
            .await
            .get(&queue)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| (m.body.clone(), m.attributes.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn receive_calls(&self, queue: QueueName) -> usize {
        self.receive_calls
            .lock()
            .await
            .get(&queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    async fn try_take(&self, queue: QueueName, max: usize) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(msgs) = queues.get_mut(&queue) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for m in msgs.iter_mut() {
            if out.len() >= max {
                break;
            }
            if m.visible_at > now {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            m.receipt = Some(receipt.clone());
            m.visible_at = now + self.visibility_timeout;
            out.push(QueueMessage {
                message_id: m.message_id.clone(),
                receipt,
                body: m.body.clone(),
                attributes: m.attributes.clone(),
            });
        }
        out
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn send(&self, queue: QueueName, message: OutgoingMessage) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let stored = StoredMessage {
            message_id: message_id.clone(),
            body: message.body,
            attributes: message.attributes,
            visible_at: Instant::now() + Duration::from_secs(message.delay_seconds),
            receipt: None,
        };
        self.queues
            .lock()
            .await
            .entry(queue)
            .or_default()
            .push(stored);
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(message_id)
    }

    async fn receive(&self, queue: QueueName, max: usize) -> Result<Vec<QueueMessage>> {
        if max == 0 {
            return Err(Error::InvalidInput("receive max must be > 0".to_string()));
        }
        *self.receive_calls.lock().await.entry(queue).or_default() += 1;

        let deadline = Instant::now() + self.wait_time;
        loop {
            let out = self.try_take(queue, max).await;
            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete(&self, queue: QueueName, receipt: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let msgs = queues.entry(queue).or_default();
        let before = msgs.len();
        msgs.retain(|m| m.receipt.as_deref() != Some(receipt));
        if msgs.len() == before {
            return Err(Error::NotFound(format!("receipt {receipt} on {queue} queue")));
        }
        Ok(())
    }
}
