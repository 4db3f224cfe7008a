//! Assemble the worker from environment configuration.

use anyhow::Context;
use std::sync::Arc;
use tributary_core::config::{env_string, redact};
use tributary_core::o11y::O11yConfig;
use tributary_core::queue::delay::JobEmitter;
use tributary_core::queue::memory::MemoryQueue;
use tributary_core::sync::memory::{MemoryIntegrationStore, MemoryOperationSink};
use tributary_core::{
    IntegrationDispatcher, IntegrationStore, OperationSink, QueueBackend, StreamScheduler,
    WorkerConfig,
};
use tributary_integrations::backends::http::{
    HttpBackendConfig, HttpIntegrationStore, HttpOperationSink,
};
use tributary_integrations::connectors::slack::api::HttpSlackApi;
use tributary_integrations::connectors::slack::{SlackConfig, SlackConnector};

/// Everything loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub worker: WorkerConfig,
    pub slack: SlackConfig,
    /// `None` when `TRIBUTARY_API_BASE_URL` is unset.
    pub http: Option<HttpBackendConfig>,
}

impl Settings {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> anyhow::Result<Self> {
        let http = match env_string("TRIBUTARY_API_BASE_URL") {
            Some(_) => Some(HttpBackendConfig::from_env()?),
            None => None,
        };
        Ok(Self {
            worker: WorkerConfig::from_env()?,
            slack: SlackConfig::from_env()?,
            http,
        })
    }

    /// Printable view with secrets redacted.
    pub fn redacted(&self) -> anyhow::Result<serde_json::Value> {
        let log = O11yConfig::from_env()?;
        Ok(serde_json::json!({
            "worker": serde_json::to_value(&self.worker)?,
            "slack": serde_json::to_value(&self.slack)?,
            "http": serde_json::to_value(&self.http)?,
            "log_format": format!("{:?}", log.format),
            "RUST_LOG": std::env::var("RUST_LOG").ok(),
            "AWS_ACCESS_KEY_ID": std::env::var("AWS_ACCESS_KEY_ID").ok().map(|v| redact(&v)),
            "sqs_enabled": cfg!(feature = "sqs"),
        }))
    }
}

/// SQS when both queue URLs are configured, otherwise an in-process queue.
pub async fn build_queue(cfg: &WorkerConfig) -> anyhow::Result<Arc<dyn QueueBackend>> {
    match (&cfg.primary_queue_url, &cfg.delay_queue_url) {
        (Some(primary), Some(delay)) => sqs_queue(cfg, primary, delay).await,
        (None, None) => {
            tracing::warn!("no queue urls configured; using in-memory queue");
            Ok(Arc::new(MemoryQueue::new(
                cfg.receive_wait,
                cfg.visibility_timeout,
            )))
        }
        _ => anyhow::bail!(
            "TRIBUTARY_PRIMARY_QUEUE_URL and TRIBUTARY_DELAY_QUEUE_URL must be set together"
        ),
    }
}

#[cfg(feature = "sqs")]
async fn sqs_queue(
    cfg: &WorkerConfig,
    primary: &str,
    delay: &str,
) -> anyhow::Result<Arc<dyn QueueBackend>> {
    use tributary_integrations::queue_backends::sqs::{real::AwsSqsApi, SqsQueueBackend};

    let client = AwsSqsApi::from_env().await;
    tracing::info!(primary, delay, "using sqs queues");
    Ok(Arc::new(
        SqsQueueBackend::new(client, primary, delay)
            .with_timing(cfg.receive_wait, cfg.visibility_timeout),
    ))
}

#[cfg(not(feature = "sqs"))]
async fn sqs_queue(
    _cfg: &WorkerConfig,
    _primary: &str,
    _delay: &str,
) -> anyhow::Result<Arc<dyn QueueBackend>> {
    anyhow::bail!("queue urls are configured but this binary was built without the `sqs` feature")
}

/// Integration store and operation sink: the HTTP API when configured, else
/// in-memory (dev only).
pub fn build_collaborators(
    settings: &Settings,
    dev: bool,
) -> anyhow::Result<(Arc<dyn IntegrationStore>, Arc<dyn OperationSink>)> {
    match (&settings.http, dev) {
        (Some(http), false) => {
            let store = HttpIntegrationStore::new(http).context("build integration store")?;
            let sink = HttpOperationSink::new(http).context("build operation sink")?;
            Ok((Arc::new(store), Arc::new(sink)))
        }
        (None, false) => anyhow::bail!("TRIBUTARY_API_BASE_URL is required (or pass --dev)"),
        (_, true) => {
            tracing::warn!("dev mode: integrations and operations are kept in memory");
            Ok((
                Arc::new(MemoryIntegrationStore::new()),
                Arc::new(MemoryOperationSink::new()),
            ))
        }
    }
}

/// One runner per supported platform, behind a dispatcher that re-enqueues
/// rate-limited jobs through the delay queue.
pub fn build_dispatcher(
    settings: &Settings,
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn IntegrationStore>,
    sink: Arc<dyn OperationSink>,
) -> anyhow::Result<IntegrationDispatcher> {
    let slack_api = HttpSlackApi::new(settings.slack.api_base.clone())?;
    let slack = SlackConnector::new(Arc::new(slack_api), settings.slack.clone());
    let slack_runner = StreamScheduler::new(Arc::new(slack), store.clone(), sink);

    let emitter = JobEmitter::new(queue, settings.worker.max_delay_per_cycle_seconds);
    let dispatcher = IntegrationDispatcher::new(
        store,
        emitter,
        settings.worker.rate_limit_padding_seconds,
    )
    .with_runner(Arc::new(slack_runner));
    tracing::info!(platforms = ?dispatcher.platforms(), "dispatcher ready");
    Ok(dispatcher)
}
