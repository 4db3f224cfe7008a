use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tributary_core::config::{env_parse_or, env_string, redact};
use tributary_core::models::{Integration, IntegrationId, IntegrationStatus, Operation, TenantId};
use tributary_core::sync::traits::{IntegrationStore, OperationSink};
use tributary_core::{Error, Result};

#[derive(Clone, Serialize)]
pub struct HttpBackendConfig {
    /// Base URL of the integrations CRUD API.
    pub api_base_url: String,
    #[serde(serialize_with = "serialize_redacted")]
    pub api_token: Option<String>,
    /// Downstream service receiving operation batches. Defaults to the API.
    pub sink_url: Option<String>,
    pub timeout: Duration,
}

fn serialize_redacted<S: serde::Serializer>(
    value: &Option<String>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(v) => s.serialize_some(&redact(v)),
        None => s.serialize_none(),
    }
}

impl std::fmt::Debug for HttpBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackendConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_deref().map(redact))
            .field("sink_url", &self.sink_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpBackendConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let api_base_url = env_string("TRIBUTARY_API_BASE_URL").ok_or_else(|| {
            Error::InvalidInput("TRIBUTARY_API_BASE_URL is required".to_string())
        })?;
        let cfg = Self {
            api_base_url,
            api_token: env_string("TRIBUTARY_API_TOKEN"),
            sink_url: env_string("TRIBUTARY_SINK_URL"),
            timeout: Duration::from_millis(env_parse_or("TRIBUTARY_API_TIMEOUT_MS", 10_000u64)?),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(Error::InvalidInput("api_base_url is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput("api timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct ApiClient {
    client: Client,
    token: Option<String>,
}

impl ApiClient {
    fn new(cfg: &HttpBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::backend("build reqwest client", e))?;
        Ok(Self {
            client,
            token: cfg.api_token.clone(),
        })
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

pub fn integration_url(base: &str, tenant_id: TenantId, integration_id: IntegrationId) -> String {
    format!("{}/tenant/{tenant_id}/integration/{integration_id}", trim_base(base))
}

pub fn operations_url(base: &str, tenant_id: TenantId) -> String {
    format!("{}/tenant/{tenant_id}/operations", trim_base(base))
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn status_error(status: StatusCode, what: &str, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Unauthorized(format!("{what}: {status}"))
        }
        StatusCode::CONFLICT => Error::Conflict(format!("{what}: {body}")),
        _ => Error::BackendMessage(format!("{what} failed: {status} {body}")),
    }
}

async fn check(resp: Response, what: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, what, &body))
}

/// `IntegrationStore` over the integrations CRUD API.
#[derive(Clone)]
pub struct HttpIntegrationStore {
    api: ApiClient,
    base_url: String,
}

impl HttpIntegrationStore {
    pub fn new(cfg: &HttpBackendConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            api: ApiClient::new(cfg)?,
            base_url: cfg.api_base_url.clone(),
        })
    }

    async fn update(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
        patch: serde_json::Value,
    ) -> Result<()> {
        let url = integration_url(&self.base_url, tenant_id, integration_id);
        let resp = self
            .api
            .auth(self.api.client.put(url))
            .json(&serde_json::json!({ "data": patch }))
            .send()
            .await
            .map_err(Error::backend_reqwest)?;
        check(resp, &format!("update integration {integration_id}")).await?;
        Ok(())
    }
}

#[async_trait]
impl IntegrationStore for HttpIntegrationStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, tenant_id: TenantId, integration_id: IntegrationId) -> Result<Integration> {
        let url = integration_url(&self.base_url, tenant_id, integration_id);
        let resp = self
            .api
            .auth(self.api.client.get(url))
            .send()
            .await
            .map_err(Error::backend_reqwest)?;
        let resp = check(resp, &format!("integration {integration_id}")).await?;
        resp.json::<Integration>()
            .await
            .map_err(|e| Error::backend("decode integration", e))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(integration_id = %integration.id))]
    async fn save_settings(&self, integration: &Integration) -> Result<()> {
        self.update(
            integration.tenant_id,
            integration.id,
            serde_json::json!({ "settings": integration.settings }),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_status(
        &self,
        tenant_id: TenantId,
        integration_id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<()> {
        self.update(
            tenant_id,
            integration_id,
            serde_json::json!({ "status": status }),
        )
        .await
    }
}

/// `OperationSink` posting each batch to the downstream upsert service.
#[derive(Clone)]
pub struct HttpOperationSink {
    api: ApiClient,
    base_url: String,
}

impl HttpOperationSink {
    pub fn new(cfg: &HttpBackendConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            api: ApiClient::new(cfg)?,
            base_url: cfg
                .sink_url
                .clone()
                .unwrap_or_else(|| cfg.api_base_url.clone()),
        })
    }
}

#[async_trait]
impl OperationSink for HttpOperationSink {
    #[tracing::instrument(level = "debug", skip(self, operation), fields(records = operation.records.len()))]
    async fn emit(&self, tenant_id: TenantId, operation: &Operation) -> Result<()> {
        let resp = self
            .api
            .auth(self.api.client.post(operations_url(&self.base_url, tenant_id)))
            .json(operation)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;
        check(resp, "emit operation").await?;
        Ok(())
    }
}
