//! Tributary core library: the connector contract, the stream scheduler that
//! drives connectors, and the queue worker runtime that runs sync jobs.

pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod queue;
pub mod sync;
pub mod worker;

pub use error::{Error, ErrorClass, RateLimitError, Result};
pub use models::{
    ActivityRecord, Integration, IntegrationId, IntegrationStatus, MemberRecord, Operation,
    OperationKind, Platform, TenantId,
};
pub use queue::{MessageAttributes, OutgoingMessage, QueueBackend, QueueMessage, QueueName};
pub use sync::engine::StreamScheduler;
pub use sync::models::{
    ExitingFlag, JobState, PipelineContext, ProcessStreamResult, ResumeState, RunSummary, Stream,
    StreamMetadata,
};
pub use sync::retrospect::RetrospectPolicy;
pub use sync::traits::{Connector, IntegrationStore, JobRunner, OperationSink};
pub use worker::{IntegrationDispatcher, MessageHandler, Worker, WorkerConfig, WorkerMessage};
