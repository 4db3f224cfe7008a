//! Integration synchronization: the connector contract and the scheduler that
//! drives a connector through its streams.
//!
//! - `traits`: `Connector`, `JobRunner`, and the collaborator seams
//!   (`IntegrationStore`, `OperationSink`)
//! - `engine`: `StreamScheduler`, one job at a time
//! - `retrospect` / `backoff`: stopping and rate-limit rules shared by connectors

pub mod backoff;
pub mod engine;
pub mod memory;
pub mod models;
pub mod retrospect;
pub mod traits;
