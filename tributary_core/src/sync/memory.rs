use crate::models::{Integration, IntegrationId, IntegrationStatus, Operation, TenantId};
use crate::sync::traits::{IntegrationStore, OperationSink};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory IntegrationStore for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryIntegrationStore {
    integrations: Arc<DashMap<(TenantId, IntegrationId), Integration>>,
}

impl MemoryIntegrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, integration: Integration) {
        self.integrations
            .insert((integration.tenant_id, integration.id), integration);
    }

    /// Snapshot of a stored integration (primarily for tests).
    pub fn snapshot(&self, tenant_id: TenantId, id: IntegrationId) -> Option<Integration> {
        self.integrations.get(&(tenant_id, id)).map(|e| e.clone())
    }
}

#[async_trait]
impl IntegrationStore for MemoryIntegrationStore {
    async fn get(&self, tenant_id: TenantId, integration_id: IntegrationId) -> Result<Integration> {
        self.snapshot(tenant_id, integration_id)
            .ok_or_else(|| Error::NotFound(format!("integration {integration_id}")))
    }

    async fn save_settings(&self, integration: &Integration) -> Result<()> {
        let mut entry = self
            .integrations
            .get_mut(&(integration.tenant_id, integration.id))
            .ok_or_else(|| Error::NotFound(format!("integration {}", integration.id)))?;
        entry.settings = integration.settings.clone();
        entry.token = integration.token.clone();
        Ok(())
    }

    async fn set_status(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<()> {
        let mut entry = self
            .integrations
            .get_mut(&(tenant_id, integration_id))
            .ok_or_else(|| Error::NotFound(format!("integration {integration_id}")))?;
        entry.status = status;
        Ok(())
    }
}

/// In-memory OperationSink that records every emitted batch.
#[derive(Clone, Default)]
pub struct MemoryOperationSink {
    operations: Arc<Mutex<Vec<(TenantId, Operation)>>>,
}

impl MemoryOperationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_operations(&self) -> Vec<(TenantId, Operation)> {
        self.operations.lock().await.clone()
    }

    pub async fn record_count(&self) -> usize {
        self.operations
            .lock()
            .await
            .iter()
            .map(|(_, op)| op.records.len())
            .sum()
    }
}

#[async_trait]
impl OperationSink for MemoryOperationSink {
    async fn emit(&self, tenant_id: TenantId, operation: &Operation) -> Result<()> {
        self.operations
            .lock()
            .await
            .push((tenant_id, operation.clone()));
        Ok(())
    }
}
