use crate::models::{
    ActivityRecord, Integration, IntegrationId, IntegrationStatus, Operation, Platform, TenantId,
};
use crate::sync::models::{JobState, PipelineContext, ProcessStreamResult, RunSummary, Stream};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// A connector pulls one platform's data page by page.
///
/// Connector implementations live in `tributary_integrations`. The scheduler
/// drives them: `preprocess` once, `get_streams` once, `process_stream` per
/// page, `postprocess` once at the end.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connector-specific state built by `preprocess` (channel lists, member
    /// caches, ...).
    type PipelineData: Send + Sync;

    /// Tagged union of the stream kinds this connector paginates. Serializable
    /// so a rate-limited job can carry its work list to the next delivery.
    type StreamKind: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync;

    fn platform(&self) -> Platform;

    /// Load everything that must be known before streams are enumerated.
    async fn preprocess(&self, job: &JobState) -> Result<Self::PipelineData>;

    /// Root streams for this run.
    async fn get_streams(
        &self,
        ctx: &PipelineContext<Self::PipelineData>,
    ) -> Result<Vec<Stream<Self::StreamKind>>>;

    /// Fetch exactly one page of `stream`.
    async fn process_stream(
        &self,
        stream: &Stream<Self::StreamKind>,
        ctx: &mut PipelineContext<Self::PipelineData>,
    ) -> Result<ProcessStreamResult<Self::StreamKind>>;

    /// Called once after every stream is exhausted. `failed_streams` are the
    /// lineages that ended on an error instead of running out of pages.
    /// Returns the integration settings to persist.
    async fn postprocess(
        &self,
        ctx: &mut PipelineContext<Self::PipelineData>,
        failed_streams: &[Stream<Self::StreamKind>],
    ) -> Result<serde_json::Value>;

    /// Whether a stream carried over from a rate-limited delivery is still
    /// valid after `preprocess` reloaded the platform state.
    fn keep_resumed_stream(
        &self,
        _ctx: &PipelineContext<Self::PipelineData>,
        _stream: &Stream<Self::StreamKind>,
    ) -> bool {
        true
    }

    /// Stopping oracle consulted when a non-new stream has another page.
    fn is_processing_finished(
        &self,
        ctx: &PipelineContext<Self::PipelineData>,
        stream: &Stream<Self::StreamKind>,
        last_operations: &[Operation],
        last_record: Option<&ActivityRecord>,
        last_record_timestamp: Option<DateTime<Utc>>,
    ) -> bool;
}

/// Object-safe view of a scheduler bound to one connector, so the worker can
/// pick a runner by platform.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn platform(&self) -> Platform;

    async fn run(&self, job: JobState) -> Result<RunSummary>;
}

/// Where integrations are read from and written back to (the CRUD layer).
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get(&self, tenant_id: TenantId, integration_id: IntegrationId) -> Result<Integration>;

    async fn save_settings(&self, integration: &Integration) -> Result<()>;

    async fn set_status(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<()>;
}

/// Downstream consumer of operation batches.
#[async_trait]
pub trait OperationSink: Send + Sync {
    async fn emit(&self, tenant_id: TenantId, operation: &Operation) -> Result<()>;
}
