//! The slice of the Slack Web API the connector uses.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;
use tributary_core::sync::backoff::{parse_retry_after, rate_limit_from_status, RateLimitInfo};
use tributary_core::{Error, Result};

pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";

/// Slack error codes meaning the token can no longer be used.
const AUTH_ERRORS: &[&str] = &[
    "invalid_auth",
    "token_revoked",
    "account_inactive",
    "not_authed",
    "token_expired",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlackTeam {
    #[serde(default)]
    pub team_id: Option<String>,
    /// Workspace URL, e.g. `https://acme.slack.com/`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlackChannel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SlackMessage {
    pub ts: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub reply_count: Option<u64>,
    #[serde(default)]
    pub reactions: Vec<serde_json::Value>,
    #[serde(default)]
    pub files: Vec<serde_json::Value>,
}

impl SlackMessage {
    pub fn is_bot(&self) -> bool {
        self.bot_id.is_some() || self.subtype.as_deref() == Some("bot_message")
    }

    /// True for a channel message that started a thread.
    pub fn has_thread(&self) -> bool {
        self.reply_count.unwrap_or(0) > 0 && self.thread_ts.as_deref() == Some(self.ts.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlackProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlackUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub profile: SlackProfile,
}

impl SlackUser {
    pub fn is_slackbot(&self) -> bool {
        self.id == "USLACKBOT" || self.name.eq_ignore_ascii_case("slackbot")
    }
}

/// One page of a cursor-paginated Slack listing.
#[derive(Debug, Clone, PartialEq)]
pub struct SlackPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub rate_limit: RateLimitInfo,
}

impl<T> SlackPage<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            rate_limit: RateLimitInfo::default(),
        }
    }

    pub fn with_cursor(items: Vec<T>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(cursor.into()),
            rate_limit: RateLimitInfo::default(),
        }
    }
}

#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn auth_test(&self, token: &str) -> Result<SlackTeam>;

    async fn list_channels(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackChannel>>;

    async fn channel_history(
        &self,
        token: &str,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackMessage>>;

    async fn thread_replies(
        &self,
        token: &str,
        channel_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackMessage>>;

    async fn list_members(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackUser>>;
}

/// Map a Slack `ok: false` error code onto the error taxonomy.
///
/// Anything that is not a rate limit or an auth failure belongs to the one
/// stream that hit it (`channel_not_found`, `not_in_channel`, ...).
pub fn classify_slack_error(
    method: &str,
    code: &str,
    retry_after: Option<&str>,
) -> Error {
    if code == "ratelimited" {
        return Error::rate_limited(parse_retry_after(retry_after), method);
    }
    if AUTH_ERRORS.contains(&code) {
        return Error::Unauthorized(format!("slack {method}: {code}"));
    }
    Error::BackendMessage(format!("slack {method} failed: {code}"))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelsBody {
    #[serde(default)]
    channels: Vec<SlackChannel>,
}

#[derive(Debug, Deserialize)]
struct MessagesBody {
    #[serde(default)]
    messages: Vec<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct MembersBody {
    #[serde(default)]
    members: Vec<SlackUser>,
}

/// `SlackApi` over HTTPS with a bot token.
#[derive(Clone)]
pub struct HttpSlackApi {
    client: Client,
    base_url: String,
}

impl HttpSlackApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[instrument(level = "debug", skip(self, token, query))]
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<(T, Option<String>, RateLimitInfo)> {
        let resp = self
            .client
            .get(format!("{}/{method}", self.base_url))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let headers = resp.headers();
        let retry_after = header_str(headers, "retry-after");
        let rate_limit = RateLimitInfo {
            remaining: header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_seconds: header_str(headers, "x-ratelimit-reset").and_then(|v| v.parse().ok()),
        };

        if let Some(e) =
            rate_limit_from_status(resp.status().as_u16(), retry_after.as_deref(), method)
        {
            return Err(e);
        }
        if !resp.status().is_success() {
            return Err(Error::BackendMessage(format!(
                "slack {method} returned HTTP {}",
                resp.status()
            )));
        }

        let raw: serde_json::Value = resp.json().await.map_err(Error::backend_reqwest)?;
        let envelope: Envelope = serde_json::from_value(raw.clone())
            .map_err(|e| Error::backend(format!("decode slack {method} envelope"), e))?;
        if !envelope.ok {
            let code = envelope.error.unwrap_or_else(|| "unknown".to_string());
            return Err(classify_slack_error(method, &code, retry_after.as_deref()));
        }
        let body: T = serde_json::from_value(raw)
            .map_err(|e| Error::backend(format!("decode slack {method} body"), e))?;
        let next_cursor = envelope
            .response_metadata
            .and_then(|m| m.next_cursor)
            .filter(|c| !c.is_empty());
        Ok((body, next_cursor, rate_limit))
    }
}

fn header_str(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn page_query(cursor: Option<&str>, limit: u32) -> Vec<(&'static str, String)> {
    let mut q = vec![("limit", limit.to_string())];
    if let Some(c) = cursor {
        q.push(("cursor", c.to_string()));
    }
    q
}

#[async_trait]
impl SlackApi for HttpSlackApi {
    async fn auth_test(&self, token: &str) -> Result<SlackTeam> {
        let (team, _, _) = self.call::<SlackTeam>("auth.test", token, &[]).await?;
        Ok(team)
    }

    async fn list_channels(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackChannel>> {
        let mut q = page_query(cursor, limit);
        q.push(("types", "public_channel".to_string()));
        q.push(("exclude_archived", "true".to_string()));
        let (body, next_cursor, rate_limit) =
            self.call::<ChannelsBody>("conversations.list", token, &q).await?;
        Ok(SlackPage {
            items: body.channels,
            next_cursor,
            rate_limit,
        })
    }

    async fn channel_history(
        &self,
        token: &str,
        channel_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackMessage>> {
        let mut q = page_query(cursor, limit);
        q.push(("channel", channel_id.to_string()));
        let (body, next_cursor, rate_limit) = self
            .call::<MessagesBody>("conversations.history", token, &q)
            .await?;
        Ok(SlackPage {
            items: body.messages,
            next_cursor,
            rate_limit,
        })
    }

    async fn thread_replies(
        &self,
        token: &str,
        channel_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackMessage>> {
        let mut q = page_query(cursor, limit);
        q.push(("channel", channel_id.to_string()));
        q.push(("ts", thread_ts.to_string()));
        let (body, next_cursor, rate_limit) = self
            .call::<MessagesBody>("conversations.replies", token, &q)
            .await?;
        Ok(SlackPage {
            items: body.messages,
            next_cursor,
            rate_limit,
        })
    }

    async fn list_members(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SlackPage<SlackUser>> {
        let q = page_query(cursor, limit);
        let (body, next_cursor, rate_limit) =
            self.call::<MembersBody>("users.list", token, &q).await?;
        Ok(SlackPage {
            items: body.members,
            next_cursor,
            rate_limit,
        })
    }
}
