#![forbid(unsafe_code)]

pub mod backends;
pub mod connectors;
pub mod queue_backends;
