//! Network queue transports for the worker runtime.
//!
//! The in-memory transport lives in `tributary_core::queue::memory`; these
//! backends implement the same `QueueBackend` trait.

pub mod sqs;
