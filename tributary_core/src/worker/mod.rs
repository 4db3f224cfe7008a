//! Queue worker runtime: receives worker messages, runs jobs with bounded
//! concurrency, and drains gracefully on shutdown.

pub mod config;
pub mod dispatch;
pub mod inflight;
pub mod message;
pub mod runtime;

pub use config::WorkerConfig;
pub use dispatch::{IntegrationDispatcher, MessageHandler};
pub use inflight::{InFlight, InFlightGuard};
pub use message::{IntegrationJob, WorkerMessage};
pub use runtime::Worker;
