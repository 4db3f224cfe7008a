use crate::queue::delay::DelayForwarder;
use crate::queue::{QueueBackend, QueueMessage, QueueName};
use crate::worker::config::WorkerConfig;
use crate::worker::dispatch::MessageHandler;
use crate::worker::inflight::InFlight;
use crate::worker::message::WorkerMessage;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Queue consumer with bounded concurrency.
///
/// Two loops share the runtime: the primary loop turns messages into spawned
/// jobs, the delay loop walks delayed messages toward their target queue.
/// Once `cancel` fires both loops stop receiving and `run` returns after every
/// in-flight job has finished.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn QueueBackend>,
    handler: Arc<dyn MessageHandler>,
    forwarder: DelayForwarder,
    inflight: InFlight,
}

impl Worker {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn QueueBackend>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let forwarder = DelayForwarder::new(queue.clone(), config.max_delay_per_cycle_seconds);
        Ok(Self {
            config,
            queue,
            handler,
            forwarder,
            inflight: InFlight::new(),
        })
    }

    pub fn in_flight(&self) -> InFlight {
        self.inflight.clone()
    }

    #[tracing::instrument(level = "info", skip_all, fields(max_concurrency = self.config.max_concurrency))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("worker started");
        tokio::join!(
            self.primary_loop(cancel.clone()),
            self.delay_loop(cancel.clone())
        );
        self.drain().await;
        tracing::info!("worker stopped");
        Ok(())
    }

    async fn primary_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let want = self.config.receive_count(self.inflight.len());
            if want == 0 {
                tracing::trace!(in_flight = self.inflight.len(), "all slots busy");
                if !self.pause(&cancel, self.config.busy_poll_interval).await {
                    break;
                }
                continue;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.queue.receive(QueueName::Primary, want) => r,
            };
            match received {
                Ok(messages) => {
                    for message in messages {
                        self.dispatch(message).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed receiving from primary queue");
                    if !self.pause(&cancel, self.config.busy_poll_interval).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("primary queue loop stopped");
    }

    async fn delay_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.queue.receive(QueueName::Delay, self.config.receive_batch_size) => r,
            };
            match received {
                Ok(messages) => {
                    for message in messages {
                        if let Err(e) = self.forwarder.forward(&message).await {
                            tracing::warn!(
                                message_id = %message.message_id,
                                error = %e,
                                "failed forwarding delayed message"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed receiving from delay queue");
                    if !self.pause(&cancel, self.config.busy_poll_interval).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("delay queue loop stopped");
    }

    /// Register, delete, then spawn. A message is removed from the queue
    /// before its job runs; failures inside the job are not redelivered.
    async fn dispatch(&self, message: QueueMessage) {
        let parsed = match WorkerMessage::parse(&message.body) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "unparseable worker message, leaving it in the queue"
                );
                return;
            }
        };

        let Some(guard) = self
            .inflight
            .try_register(self.config.max_concurrency, parsed.kind())
        else {
            tracing::warn!(message_id = %message.message_id, "no free slot, message will be redelivered");
            return;
        };

        if let Err(e) = self
            .queue
            .delete(QueueName::Primary, &message.receipt)
            .await
        {
            tracing::warn!(message_id = %message.message_id, error = %e, "failed deleting message, skipping");
            return;
        }

        let span = tracing::info_span!(
            "worker_job",
            message_id = %message.message_id,
            job_id = %guard.id(),
            kind = parsed.kind(),
            tenant_id = %parsed.tenant_id(),
        );
        let handler = self.handler.clone();
        tokio::spawn(
            async move {
                let exiting = guard.exiting();
                let _guard = guard;
                match handler.handle(parsed, exiting).await {
                    Ok(()) => tracing::debug!("job finished"),
                    Err(e) => tracing::error!(error = %e, "job failed"),
                }
            }
            .instrument(span),
        );
    }

    async fn drain(&self) {
        let marked = self.inflight.mark_all_exiting();
        tracing::info!(in_flight = marked, "draining in-flight jobs");
        while !self.inflight.is_empty() {
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }

    /// Sleep unless cancelled first; returns false on cancellation.
    async fn pause(&self, cancel: &CancellationToken, d: std::time::Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}
