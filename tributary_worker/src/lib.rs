#![forbid(unsafe_code)]

pub mod cli;
pub mod signal;
pub mod wiring;
