use crate::error::{Error, ErrorClass};
use crate::models::{IntegrationStatus, Operation, Platform};
use crate::sync::models::{
    JobState, PipelineContext, ProcessStreamResult, ResumeState, RunSummary, Stream,
};
use crate::sync::traits::{Connector, IntegrationStore, JobRunner, OperationSink};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

const PROGRESS_LOG_EVERY: u64 = 50;

/// Drives one connector through all of its streams for a single job.
///
/// Streams live on a LIFO work list. Children discovered on a page (threads,
/// replies) are pushed after the page's own continuation, so they are handled
/// before the parent lineage moves on.
pub struct StreamScheduler<C: Connector> {
    connector: Arc<C>,
    store: Arc<dyn IntegrationStore>,
    sink: Arc<dyn OperationSink>,
}

impl<C: Connector> StreamScheduler<C> {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        connector: Arc<C>,
        store: Arc<dyn IntegrationStore>,
        sink: Arc<dyn OperationSink>,
    ) -> Self {
        Self {
            connector,
            store,
            sink,
        }
    }

    /// Run a job to completion.
    ///
    /// Rate limits come back as `Error::RateLimited` with the integration left
    /// untouched and the unfinished work list in `resume`, so the caller can
    /// re-deliver the job and continue from there. Job-fatal errors mark
    /// the integration errored before returning.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            tenant_id = %job.integration.tenant_id,
            integration_id = %job.integration.id,
            platform = %job.integration.platform,
            onboarding = job.onboarding,
        )
    )]
    pub async fn run_job(&self, job: JobState) -> Result<RunSummary> {
        let tenant_id = job.integration.tenant_id;
        let integration_id = job.integration.id;

        self.store
            .set_status(tenant_id, integration_id, IntegrationStatus::InProgress)
            .await?;

        match self.sync(job).await {
            Ok(summary) => {
                tracing::info!(
                    streams_processed = summary.streams_processed,
                    streams_failed = summary.streams_failed,
                    records_emitted = summary.records_emitted,
                    "done processing integration"
                );
                Ok(summary)
            }
            Err(e) => {
                match e.class() {
                    ErrorClass::RateLimit { reset_seconds } => {
                        tracing::warn!(reset_seconds, error = %e, "rate limit reached, job will be delayed");
                    }
                    _ => {
                        tracing::error!(error = %e, "integration processing failed");
                        if let Err(se) = self
                            .store
                            .set_status(tenant_id, integration_id, IntegrationStatus::Error)
                            .await
                        {
                            tracing::warn!(error = %se, "failed marking integration as errored");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn sync(&self, job: JobState) -> Result<RunSummary> {
        tracing::debug!("preprocessing integration");
        let data = self.connector.preprocess(&job).await?;
        let mut ctx = PipelineContext::new(job, data);

        let (mut pending, mut failed) = match self.resumed(&ctx) {
            Some(state) => state,
            None => {
                let mut roots = self.connector.get_streams(&ctx).await?;
                tracing::info!(streams = roots.len(), "detected root streams");
                // First root stream is processed first.
                roots.reverse();
                (roots, Vec::new())
            }
        };

        let mut summary = RunSummary::default();
        let mut exiting_logged = false;

        while let Some(stream) = pending.pop() {
            if !exiting_logged && ctx.job.exiting.is_set() {
                tracing::info!("worker is draining, finishing in-flight job");
                exiting_logged = true;
            }

            summary.streams_processed += 1;
            if summary.streams_processed % PROGRESS_LOG_EVERY == 0 {
                tracing::info!(
                    streams_processed = summary.streams_processed,
                    pending = pending.len(),
                    "processing streams"
                );
            }

            tracing::trace!(stream = ?stream.kind, page = ?stream.metadata.page, "processing stream");
            let result = match self.connector.process_stream(&stream, &mut ctx).await {
                Ok(r) => r,
                Err(e) => match e.class() {
                    ErrorClass::RateLimit { .. } => {
                        pending.push(stream);
                        return Err(with_resume(e, pending, failed));
                    }
                    ErrorClass::Job => return Err(e),
                    ErrorClass::Stream | ErrorClass::Record => {
                        tracing::warn!(stream = ?stream.kind, error = %e, "error while processing stream");
                        summary.streams_failed += 1;
                        failed.push(stream);
                        continue;
                    }
                },
            };

            let emitted = self
                .emit(&ctx, &result.operations, &mut summary)
                .await;
            let keep_paging = match emitted {
                Ok(()) => self.should_continue(&ctx, &stream, &result),
                Err(e) => {
                    tracing::warn!(stream = ?stream.kind, error = %e, "error emitting stream results");
                    summary.streams_failed += 1;
                    failed.push(stream.clone());
                    false
                }
            };

            if keep_paging {
                if let Some(next) = result.next_page_stream {
                    tracing::trace!(stream = ?next.kind, "detected next page stream");
                    pending.push(next);
                }
            }

            if !result.new_streams.is_empty() {
                tracing::debug!(count = result.new_streams.len(), "detected new streams to process");
                pending.extend(result.new_streams.into_iter().rev());
            }
        }

        let settings = self.connector.postprocess(&mut ctx, &failed).await?;
        let mut integration = ctx.job.integration;
        integration.settings = settings;
        integration.status = IntegrationStatus::Done;
        self.store.save_settings(&integration).await?;
        self.store
            .set_status(integration.tenant_id, integration.id, IntegrationStatus::Done)
            .await?;

        Ok(summary)
    }

    /// Work list carried over from a rate-limited delivery, if any and still
    /// readable. Streams the connector no longer recognizes are dropped.
    fn resumed(
        &self,
        ctx: &PipelineContext<C::PipelineData>,
    ) -> Option<(Vec<Stream<C::StreamKind>>, Vec<Stream<C::StreamKind>>)> {
        let raw = ctx.job.resume.clone()?;
        let state: ResumeState<C::StreamKind> = match serde_json::from_value(raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable resume state, starting from root streams");
                return None;
            }
        };
        let before = state.pending.len();
        let pending: Vec<_> = state
            .pending
            .into_iter()
            .filter(|s| self.connector.keep_resumed_stream(ctx, s))
            .collect();
        tracing::info!(
            pending = pending.len(),
            dropped = before - pending.len(),
            failed = state.failed.len(),
            "resuming rate limited job"
        );
        Some((pending, state.failed))
    }

    async fn emit(
        &self,
        ctx: &PipelineContext<C::PipelineData>,
        operations: &[Operation],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let tenant_id = ctx.integration().tenant_id;
        for op in operations.iter().filter(|op| !op.is_empty()) {
            tracing::trace!(records = op.records.len(), "emitting operation");
            self.sink.emit(tenant_id, op).await?;
            summary.operations_emitted += 1;
            summary.records_emitted += op.records.len() as u64;
        }
        Ok(())
    }

    fn should_continue(
        &self,
        ctx: &PipelineContext<C::PipelineData>,
        stream: &Stream<C::StreamKind>,
        result: &ProcessStreamResult<C::StreamKind>,
    ) -> bool {
        if result.next_page_stream.is_none() {
            return false;
        }
        // New sources and onboarding runs are always backfilled completely.
        if stream.is_new() || ctx.job.onboarding {
            return true;
        }
        let finished = self.connector.is_processing_finished(
            ctx,
            stream,
            &result.operations,
            result.last_record.as_ref(),
            result.last_record_timestamp,
        );
        if finished {
            tracing::debug!(stream = ?stream.kind, "stream finished by connector oracle");
        }
        !finished
    }
}

/// Attach the remaining work list to a rate-limit error.
fn with_resume<K: serde::Serialize>(
    err: Error,
    pending: Vec<Stream<K>>,
    failed: Vec<Stream<K>>,
) -> Error {
    let Error::RateLimited(rl) = err else {
        return err;
    };
    match serde_json::to_value(ResumeState { pending, failed }) {
        Ok(resume) => Error::RateLimited(rl.with_resume(resume)),
        Err(e) => {
            tracing::warn!(error = %e, "could not serialize resume state, job will restart");
            Error::RateLimited(rl)
        }
    }
}

#[async_trait]
impl<C: Connector> JobRunner for StreamScheduler<C> {
    fn platform(&self) -> Platform {
        self.connector.platform()
    }

    async fn run(&self, job: JobState) -> Result<RunSummary> {
        self.run_job(job).await
    }
}
