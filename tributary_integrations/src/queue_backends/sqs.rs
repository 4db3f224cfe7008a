//! AWS SQS-backed queue transport.
//!
//! Logical queues map onto two SQS queue URLs. Delay bookkeeping and the
//! tenant travel as SQS message attributes, never inside the body.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;
use tributary_core::queue::{
    MessageAttributes, OutgoingMessage, QueueBackend, QueueMessage, QueueName,
};
use tributary_core::{Error, Result};

pub const ATTR_TENANT_ID: &str = "tenant_id";
pub const ATTR_REMAINING_DELAY: &str = "remaining_delay_seconds";
pub const ATTR_TARGET_QUEUE: &str = "target_queue";

/// A message as returned by SQS, attributes flattened to strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

#[async_trait]
pub trait SqsApi: Send + Sync {
    async fn send_message(
        &self,
        queue_url: &str,
        body: String,
        delay_seconds: i32,
        attributes: HashMap<String, String>,
    ) -> Result<String>;
    async fn receive_messages(
        &self,
        queue_url: &str,
        max: i32,
        wait_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<SqsMessage>>;
    async fn delete_message(&self, queue_url: &str, receipt: &str) -> Result<()>;
}

pub fn encode_attributes(attrs: &MessageAttributes) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(t) = &attrs.tenant_id {
        out.insert(ATTR_TENANT_ID.to_string(), t.clone());
    }
    if let Some(r) = attrs.remaining_delay_seconds {
        out.insert(ATTR_REMAINING_DELAY.to_string(), r.to_string());
    }
    if let Some(q) = attrs.target_queue {
        out.insert(ATTR_TARGET_QUEUE.to_string(), q.to_string());
    }
    out
}

/// Unparseable delay attributes are dropped; the delay forwarder then treats
/// the message as due.
pub fn decode_attributes(raw: &HashMap<String, String>) -> MessageAttributes {
    MessageAttributes {
        tenant_id: raw.get(ATTR_TENANT_ID).cloned(),
        remaining_delay_seconds: raw.get(ATTR_REMAINING_DELAY).and_then(|v| v.parse().ok()),
        target_queue: raw.get(ATTR_TARGET_QUEUE).and_then(|v| v.parse().ok()),
    }
}

#[derive(Clone)]
pub struct SqsQueueBackend<C: SqsApi> {
    client: C,
    primary_url: String,
    delay_url: String,
    wait: Duration,
    visibility_timeout: Duration,
}

impl<C: SqsApi> SqsQueueBackend<C> {
    pub fn new(client: C, primary_url: impl Into<String>, delay_url: impl Into<String>) -> Self {
        Self {
            client,
            primary_url: primary_url.into(),
            delay_url: delay_url.into(),
            wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timing(mut self, wait: Duration, visibility_timeout: Duration) -> Self {
        self.wait = wait;
        self.visibility_timeout = visibility_timeout;
        self
    }

    fn url(&self, queue: QueueName) -> &str {
        match queue {
            QueueName::Primary => &self.primary_url,
            QueueName::Delay => &self.delay_url,
        }
    }
}

fn to_i32(value: u64, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::InvalidInput(format!("{what} out of range: {value}")))
}

#[async_trait]
impl<C: SqsApi> QueueBackend for SqsQueueBackend<C> {
    #[instrument(level = "debug", skip(self, message), fields(delay = message.delay_seconds))]
    async fn send(&self, queue: QueueName, message: OutgoingMessage) -> Result<String> {
        let attributes = encode_attributes(&message.attributes);
        let delay = to_i32(message.delay_seconds, "delay_seconds")?;
        self.client
            .send_message(self.url(queue), message.body, delay, attributes)
            .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn receive(&self, queue: QueueName, max: usize) -> Result<Vec<QueueMessage>> {
        let max = to_i32(max as u64, "max")?;
        let messages = self
            .client
            .receive_messages(
                self.url(queue),
                max,
                to_i32(self.wait.as_secs(), "wait")?,
                to_i32(self.visibility_timeout.as_secs(), "visibility_timeout")?,
            )
            .await?;
        Ok(messages
            .into_iter()
            .map(|m| QueueMessage {
                attributes: decode_attributes(&m.attributes),
                message_id: m.message_id,
                receipt: m.receipt,
                body: m.body,
            })
            .collect())
    }

    #[instrument(level = "debug", skip(self, receipt))]
    async fn delete(&self, queue: QueueName, receipt: &str) -> Result<()> {
        self.client.delete_message(self.url(queue), receipt).await
    }
}

/// Real SQS client adapter (only compiled when the `sqs` feature is enabled).
#[cfg(feature = "sqs")]
pub mod real {
    use super::{SqsApi, SqsMessage};
    use aws_sdk_sqs::types::MessageAttributeValue;
    use aws_sdk_sqs::Client as SqsClient;
    use std::collections::HashMap;
    use tracing::instrument;
    use tributary_core::{Error, Result};

    #[derive(Clone)]
    pub struct AwsSqsApi {
        inner: SqsClient,
    }

    impl AwsSqsApi {
        pub fn new(inner: SqsClient) -> Self {
            Self { inner }
        }

        pub async fn from_env() -> Self {
            let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Self::new(SqsClient::new(&cfg))
        }
    }

    #[async_trait::async_trait]
    impl SqsApi for AwsSqsApi {
        #[instrument(level = "debug", skip(self, body, attributes))]
        async fn send_message(
            &self,
            queue_url: &str,
            body: String,
            delay_seconds: i32,
            attributes: HashMap<String, String>,
        ) -> Result<String> {
            let mut req = self
                .inner
                .send_message()
                .queue_url(queue_url)
                .message_body(body)
                .delay_seconds(delay_seconds);
            for (k, v) in attributes {
                let value = MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(v)
                    .build()
                    .map_err(|e| Error::backend("sqs message attribute", e))?;
                req = req.message_attributes(k, value);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::BackendMessage(format!("sqs send: {e}")))?;
            Ok(resp.message_id.unwrap_or_default())
        }

        #[instrument(level = "debug", skip(self))]
        async fn receive_messages(
            &self,
            queue_url: &str,
            max: i32,
            wait_seconds: i32,
            visibility_timeout: i32,
        ) -> Result<Vec<SqsMessage>> {
            let resp = self
                .inner
                .receive_message()
                .queue_url(queue_url)
                .max_number_of_messages(max)
                .wait_time_seconds(wait_seconds)
                .visibility_timeout(visibility_timeout)
                .message_attribute_names("All")
                .send()
                .await
                .map_err(|e| Error::BackendMessage(format!("sqs receive: {e}")))?;
            let mut out = Vec::new();
            for m in resp.messages.unwrap_or_default() {
                let (Some(body), Some(receipt)) = (m.body, m.receipt_handle) else {
                    continue;
                };
                let attributes = m
                    .message_attributes
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(k, v)| v.string_value.map(|s| (k, s)))
                    .collect();
                out.push(SqsMessage {
                    message_id: m.message_id.unwrap_or_default(),
                    receipt,
                    body,
                    attributes,
                });
            }
            Ok(out)
        }

        #[instrument(level = "debug", skip(self, receipt))]
        async fn delete_message(&self, queue_url: &str, receipt: &str) -> Result<()> {
            self.inner
                .delete_message()
                .queue_url(queue_url)
                .receipt_handle(receipt)
                .send()
                .await
                .map_err(|e| Error::BackendMessage(format!("sqs delete: {e}")))?;
            Ok(())
        }
    }
}
