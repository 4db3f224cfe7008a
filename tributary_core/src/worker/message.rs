use crate::models::{IntegrationId, TenantId};
use serde::{Deserialize, Serialize};

/// Body of a message on the primary queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Integration(IntegrationJob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationJob {
    pub tenant_id: TenantId,
    pub integration_id: IntegrationId,
    #[serde(default)]
    pub onboarding: bool,
    /// Work left over by a rate-limited delivery of the same job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<serde_json::Value>,
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integration(_) => "integration",
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        match self {
            Self::Integration(job) => job.tenant_id,
        }
    }

    pub fn parse(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}
