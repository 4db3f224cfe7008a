use crate::models::{IntegrationStatus, Platform};
use crate::queue::delay::JobEmitter;
use crate::sync::backoff::redelivery_delay_seconds;
use crate::sync::models::{ExitingFlag, JobState};
use crate::sync::traits::{IntegrationStore, JobRunner};
use crate::worker::message::{IntegrationJob, WorkerMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Processes one parsed worker message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: WorkerMessage, exiting: ExitingFlag) -> Result<()>;
}

/// Routes worker messages to the job runner registered for their platform.
pub struct IntegrationDispatcher {
    store: Arc<dyn IntegrationStore>,
    runners: HashMap<Platform, Arc<dyn JobRunner>>,
    emitter: JobEmitter,
    rate_limit_padding_seconds: u64,
}

impl IntegrationDispatcher {
    pub fn new(
        store: Arc<dyn IntegrationStore>,
        emitter: JobEmitter,
        rate_limit_padding_seconds: u64,
    ) -> Self {
        Self {
            store,
            runners: HashMap::new(),
            emitter,
            rate_limit_padding_seconds,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runners.insert(runner.platform(), runner);
        self
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.runners.keys().copied().collect()
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(tenant_id = %job.tenant_id, integration_id = %job.integration_id)
    )]
    async fn run_integration(&self, mut job: IntegrationJob, exiting: ExitingFlag) -> Result<()> {
        let integration = self.store.get(job.tenant_id, job.integration_id).await?;
        let Some(runner) = self.runners.get(&integration.platform) else {
            if let Err(e) = self
                .store
                .set_status(job.tenant_id, job.integration_id, IntegrationStatus::Error)
                .await
            {
                tracing::warn!(error = %e, "failed to mark integration errored");
            }
            return Err(Error::Fatal(format!(
                "no connector registered for platform {}",
                integration.platform
            )));
        };

        let state =
            JobState::new(integration, job.onboarding, exiting).with_resume(job.resume.take());
        match runner.run(state).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let Some(rl) = e.as_rate_limit() else {
                    return Err(e);
                };
                let delay = redelivery_delay_seconds(rl.reset_seconds, self.rate_limit_padding_seconds);
                tracing::info!(
                    delay_seconds = delay,
                    endpoint = %rl.endpoint,
                    resumable = rl.resume.is_some(),
                    "re-enqueueing rate limited integration"
                );
                job.resume = rl.resume.clone();
                let tenant_id = job.tenant_id;
                self.emitter
                    .send(tenant_id, &WorkerMessage::Integration(job), delay)
                    .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for IntegrationDispatcher {
    async fn handle(&self, message: WorkerMessage, exiting: ExitingFlag) -> Result<()> {
        match message {
            WorkerMessage::Integration(job) => self.run_integration(job, exiting).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Integration, TenantId};
    use crate::queue::memory::MemoryQueue;
    use crate::queue::{QueueName, QueueBackend};
    use crate::sync::memory::MemoryIntegrationStore;
    use crate::sync::models::RunSummary;
    use std::sync::Mutex;

    struct ScriptedRunner {
        outcome: Mutex<Option<Result<RunSummary>>>,
        seen_onboarding: Mutex<Option<bool>>,
        seen_resume: Mutex<Option<serde_json::Value>>,
    }

    impl ScriptedRunner {
        fn new(outcome: Result<RunSummary>) -> Self {
            Self {
                outcome: Mutex::new(Some(outcome)),
                seen_onboarding: Mutex::new(None),
                seen_resume: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        fn platform(&self) -> Platform {
            Platform::Slack
        }

        async fn run(&self, job: JobState) -> Result<RunSummary> {
            *self.seen_onboarding.lock().unwrap() = Some(job.onboarding);
            *self.seen_resume.lock().unwrap() = job.resume.clone();
            self.outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(RunSummary::default()))
        }
    }

    fn setup(
        outcome: Result<RunSummary>,
    ) -> (IntegrationDispatcher, Arc<MemoryQueue>, Arc<ScriptedRunner>, IntegrationJob) {
        let (store, job) = seeded_store();
        let queue = Arc::new(MemoryQueue::default());
        let runner = Arc::new(ScriptedRunner::new(outcome));
        let dispatcher = IntegrationDispatcher::new(
            Arc::new(store),
            JobEmitter::new(queue.clone(), 900),
            30,
        )
        .with_runner(runner.clone());
        (dispatcher, queue, runner, job)
    }

    fn seeded_store() -> (MemoryIntegrationStore, IntegrationJob) {
        let store = MemoryIntegrationStore::new();
        let tenant = TenantId::new();
        let integration = Integration::new(tenant, Platform::Slack, None, serde_json::json!({}));
        let job = IntegrationJob {
            tenant_id: tenant,
            integration_id: integration.id,
            onboarding: true,
            resume: None,
        };
        store.insert(integration);
        (store, job)
    }

    #[tokio::test]
    async fn runs_job_with_onboarding_flag() {
        let (dispatcher, queue, runner, job) = setup(Ok(RunSummary::default()));
        dispatcher
            .handle(WorkerMessage::Integration(job), ExitingFlag::new())
            .await
            .unwrap();
        assert_eq!(*runner.seen_onboarding.lock().unwrap(), Some(true));
        assert_eq!(queue.sent_count(), 0);
    }

    #[tokio::test]
    async fn rate_limit_is_re_enqueued_with_padding() {
        let (dispatcher, queue, _runner, job) =
            setup(Err(Error::rate_limited(60, "conversations.history")));
        dispatcher
            .handle(WorkerMessage::Integration(job.clone()), ExitingFlag::new())
            .await
            .unwrap();

        let held = queue.peek(QueueName::Delay).await;
        assert_eq!(held.len(), 1);
        let (body, attributes) = &held[0];
        assert_eq!(attributes.remaining_delay_seconds, Some(90));
        assert_eq!(
            WorkerMessage::parse(body).unwrap(),
            WorkerMessage::Integration(job)
        );
    }

    #[tokio::test]
    async fn other_errors_propagate_without_re_enqueue() {
        let (dispatcher, queue, _runner, job) = setup(Err(Error::Fatal("boom".to_string())));
        let err = dispatcher
            .handle(WorkerMessage::Integration(job), ExitingFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(queue.len(QueueName::Delay).await, 0);
        assert!(queue.receive(QueueName::Primary, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_integration_is_not_found() {
        let (dispatcher, _queue, _runner, mut job) = setup(Ok(RunSummary::default()));
        job.integration_id = crate::models::IntegrationId::new();
        let err = dispatcher
            .handle(WorkerMessage::Integration(job), ExitingFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn rate_limit_carries_pending_work_into_redelivery() {
        let pending = serde_json::json!({ "pending": [{ "kind": "page-2" }], "failed": [] });
        let (dispatcher, queue, _runner, job) = setup(Err(Error::RateLimited(
            crate::error::RateLimitError::new(10, "conversations.history")
                .with_resume(pending.clone()),
        )));
        dispatcher
            .handle(WorkerMessage::Integration(job), ExitingFlag::new())
            .await
            .unwrap();

        let held = queue.peek(QueueName::Delay).await;
        let WorkerMessage::Integration(redelivered) = WorkerMessage::parse(&held[0].0).unwrap();
        assert_eq!(redelivered.resume, Some(pending));
    }

    #[tokio::test]
    async fn resume_state_is_handed_to_runner() {
        let (dispatcher, _queue, runner, mut job) = setup(Ok(RunSummary::default()));
        job.resume = Some(serde_json::json!({ "pending": [] }));
        dispatcher
            .handle(WorkerMessage::Integration(job), ExitingFlag::new())
            .await
            .unwrap();
        assert_eq!(
            *runner.seen_resume.lock().unwrap(),
            Some(serde_json::json!({ "pending": [] }))
        );
    }

    #[tokio::test]
    async fn missing_runner_marks_integration_errored() {
        let (store, job) = seeded_store();
        let queue = Arc::new(MemoryQueue::default());
        let dispatcher =
            IntegrationDispatcher::new(Arc::new(store.clone()), JobEmitter::new(queue, 900), 30);

        let err = dispatcher
            .handle(WorkerMessage::Integration(job.clone()), ExitingFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        let stored = store.snapshot(job.tenant_id, job.integration_id).unwrap();
        assert_eq!(stored.status, IntegrationStatus::Error);
    }
}
