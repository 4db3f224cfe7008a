//! Collaborator adapters over the platform's HTTP services.

pub mod http;
