//! Platform connectors implementing `tributary_core::sync::traits::Connector`.

#[cfg(feature = "slack")]
pub mod slack;
