use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
}

/// Tenant identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TenantId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TenantId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Integration identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrationId(pub Uuid);

impl IntegrationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntegrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntegrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for IntegrationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for IntegrationId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Platforms with a connector implementation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Slack,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slack" => Ok(Self::Slack),
            other => Err(IdParseError::UnknownPlatform(other.to_string())),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

/// A tenant's connection to one platform.
///
/// `settings` is connector-defined; connectors deserialize the parts they own
/// and hand back a replacement from `postprocess`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub tenant_id: TenantId,
    pub platform: Platform,
    /// Platform access token. Never logged.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Value,
    pub status: IntegrationStatus,
}

impl Integration {
    pub fn new(
        tenant_id: TenantId,
        platform: Platform,
        token: Option<String>,
        settings: serde_json::Value,
    ) -> Self {
        Self {
            id: IntegrationId(Uuid::new_v4()),
            tenant_id,
            platform,
            token,
            settings,
            status: IntegrationStatus::Pending,
        }
    }
}

/// Platform identity of a member, attached to every activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub username: String,
    pub source_id: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Canonical activity handed to the downstream upsert service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub tenant_id: TenantId,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub source_id: String,
    #[serde(default)]
    pub source_parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
    pub member: MemberRecord,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "upsert-activities-with-members")]
    UpsertActivitiesWithMembers,
}

/// One batch of records for the output sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub records: Vec<ActivityRecord>,
}

impl Operation {
    pub fn upsert_activities(records: Vec<ActivityRecord>) -> Self {
        Self {
            kind: OperationKind::UpsertActivitiesWithMembers,
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
