//! Slack connector.
//!
//! Streams:
//! - `Members`: workspace members, recorded as `channel_joined` activities and
//!   cached so messages can be attributed and mentions rewritten.
//! - `Channel`: history of one public channel, newest first. Messages that
//!   started a thread fan out into a `Thread` stream.
//! - `Thread`: replies of one thread.
//!
//! Settings persisted on the integration: `channels` (known channel ids and
//! names) and `members` (user id to username). A new channel whose backfill
//! failed is left out of `channels`, so the next run backfills it again.

pub mod api;
pub mod mapping;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;
use tributary_core::config::{env_parse_or, env_string};
use tributary_core::models::{ActivityRecord, Operation, Platform};
use tributary_core::sync::models::{JobState, PipelineContext, ProcessStreamResult, Stream};
use tributary_core::sync::retrospect::{RetrospectPolicy, DEFAULT_MAX_RETROSPECT_SECONDS};
use tributary_core::sync::traits::Connector;
use tributary_core::{Error, Result};

use api::{SlackApi, SlackPage, DEFAULT_SLACK_API_BASE};
use mapping::{joined_activity, message_activity, rewrite_mentions, MessagePlacement};

#[derive(Debug, Clone, Serialize)]
pub struct SlackConfig {
    pub max_retrospect_seconds: u64,
    pub page_size: u32,
    pub api_base: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            max_retrospect_seconds: DEFAULT_MAX_RETROSPECT_SECONDS,
            page_size: 200,
            api_base: DEFAULT_SLACK_API_BASE.to_string(),
        }
    }
}

impl SlackConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            max_retrospect_seconds: env_parse_or(
                "TRIBUTARY_SLACK_MAX_RETROSPECT_SECONDS",
                d.max_retrospect_seconds,
            )?,
            page_size: env_parse_or("TRIBUTARY_SLACK_PAGE_SIZE", d.page_size)?,
            api_base: env_string("TRIBUTARY_SLACK_API_BASE").unwrap_or(d.api_base),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > 1000 {
            return Err(Error::InvalidInput(
                "slack page_size must be within 1..=1000".to_string(),
            ));
        }
        if self.api_base.trim().is_empty() {
            return Err(Error::InvalidInput("slack api_base is empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlackStreamKind {
    Members,
    Channel {
        channel_id: String,
    },
    Thread {
        channel_id: String,
        channel_name: String,
        thread_id: String,
        placeholder: String,
    },
}

impl SlackStreamKind {
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::Members => None,
            Self::Channel { channel_id } | Self::Thread { channel_id, .. } => {
                Some(channel_id.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownChannel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SlackSettings {
    #[serde(default)]
    channels: Vec<KnownChannel>,
    #[serde(default)]
    members: BTreeMap<String, String>,
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub id: String,
    pub name: String,
    /// Not present in the integration's settings before this run.
    pub new: bool,
}

/// Not `Debug`: holds the platform token.
pub struct SlackPipelineData {
    token: String,
    workspace_url: Option<String>,
    pub channels: Vec<ChannelState>,
    pub members: BTreeMap<String, String>,
    other_settings: serde_json::Map<String, serde_json::Value>,
    /// Quota exhausted by the previous call; the next call reports it.
    pending_rate_limit: Option<(u64, String)>,
}

impl SlackPipelineData {
    fn channel(&self, id: &str) -> Option<&ChannelState> {
        self.channels.iter().find(|c| c.id == id)
    }
}

#[derive(Clone)]
pub struct SlackConnector {
    api: Arc<dyn SlackApi>,
    config: SlackConfig,
    policy: RetrospectPolicy,
}

impl SlackConnector {
    pub fn new(api: Arc<dyn SlackApi>, config: SlackConfig) -> Self {
        let policy = RetrospectPolicy::new(config.max_retrospect_seconds);
        Self {
            api,
            config,
            policy,
        }
    }

    /// Remember an exhausted quota so the following call aborts the job
    /// instead of the platform rejecting it.
    fn note_quota<T>(data: &mut SlackPipelineData, page: &SlackPage<T>, endpoint: &str) {
        if let Some(secs) = page.rate_limit.pause_seconds() {
            tracing::debug!(endpoint, reset_seconds = secs, "slack quota exhausted");
            data.pending_rate_limit = Some((secs, endpoint.to_string()));
        }
    }

    async fn list_all_channels(&self, token: &str) -> Result<Vec<api::SlackChannel>> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .api
                .list_channels(token, cursor.as_deref(), self.config.page_size)
                .await?;
            out.extend(page.items);
            match page.next_cursor {
                Some(next) => {
                    page.rate_limit.check("conversations.list")?;
                    cursor = Some(next);
                }
                None => return Ok(out),
            }
        }
    }

    fn process_members(
        &self,
        ctx: &mut PipelineContext<SlackPipelineData>,
        page: SlackPage<api::SlackUser>,
    ) -> Vec<ActivityRecord> {
        let tenant_id = ctx.integration().tenant_id;
        let timestamp = if ctx.job.onboarding {
            DateTime::<Utc>::UNIX_EPOCH
        } else {
            Utc::now()
        };
        let mut records = Vec::new();
        for user in page.items {
            if user.is_bot || user.is_slackbot() || user.deleted {
                continue;
            }
            if ctx.data.members.contains_key(&user.id) {
                continue;
            }
            ctx.data.members.insert(user.id.clone(), user.name.clone());
            records.push(joined_activity(tenant_id, &user.id, &user.name, timestamp));
        }
        records
    }

    fn convert_messages(
        &self,
        ctx: &PipelineContext<SlackPipelineData>,
        messages: &[api::SlackMessage],
        placement: &MessagePlacement<'_>,
    ) -> Vec<ActivityRecord> {
        let tenant_id = ctx.integration().tenant_id;
        messages
            .iter()
            .filter_map(|m| {
                match message_activity(
                    tenant_id,
                    m,
                    placement,
                    &ctx.data.members,
                    ctx.data.workspace_url.as_deref(),
                ) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(ts = %m.ts, error = %e, "skipping slack message");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl Connector for SlackConnector {
    type PipelineData = SlackPipelineData;
    type StreamKind = SlackStreamKind;

    fn platform(&self) -> Platform {
        Platform::Slack
    }

    #[instrument(level = "debug", skip_all)]
    async fn preprocess(&self, job: &JobState) -> Result<SlackPipelineData> {
        let token = job
            .integration
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Unauthorized("slack integration has no token".to_string()))?;

        let settings: SlackSettings = if job.integration.settings.is_null() {
            SlackSettings::default()
        } else {
            serde_json::from_value(job.integration.settings.clone())
                .map_err(|e| Error::InvalidInput(format!("slack settings: {e}")))?
        };

        let team = self.api.auth_test(&token).await?;
        let channels: Vec<ChannelState> = self
            .list_all_channels(&token)
            .await?
            .into_iter()
            .map(|c| {
                let new = !settings.channels.iter().any(|k| k.id == c.id);
                ChannelState {
                    id: c.id,
                    name: c.name,
                    new,
                }
            })
            .collect();
        tracing::info!(
            channels = channels.len(),
            new_channels = channels.iter().filter(|c| c.new).count(),
            known_members = settings.members.len(),
            "loaded slack workspace"
        );

        Ok(SlackPipelineData {
            token,
            workspace_url: team.url,
            channels,
            members: settings.members,
            other_settings: settings.other,
            pending_rate_limit: None,
        })
    }

    async fn get_streams(
        &self,
        ctx: &PipelineContext<SlackPipelineData>,
    ) -> Result<Vec<Stream<SlackStreamKind>>> {
        // Members first: messages are only attributed to known members.
        let mut streams = vec![Stream::root(SlackStreamKind::Members, ctx.job.onboarding)];
        streams.extend(ctx.data.channels.iter().map(|c| {
            Stream::root(
                SlackStreamKind::Channel {
                    channel_id: c.id.clone(),
                },
                c.new,
            )
        }));
        Ok(streams)
    }

    #[instrument(level = "debug", skip_all, fields(stream = ?stream.kind))]
    async fn process_stream(
        &self,
        stream: &Stream<SlackStreamKind>,
        ctx: &mut PipelineContext<SlackPipelineData>,
    ) -> Result<ProcessStreamResult<SlackStreamKind>> {
        if let Some((secs, endpoint)) = ctx.data.pending_rate_limit.take() {
            return Err(Error::rate_limited(secs, endpoint));
        }
        let cursor = stream.cursor();
        let limit = self.config.page_size;

        match &stream.kind {
            SlackStreamKind::Members => {
                let page = self
                    .api
                    .list_members(&ctx.data.token, cursor, limit)
                    .await?;
                Self::note_quota(&mut ctx.data, &page, "users.list");
                let next = page.next_cursor.clone().map(|c| stream.next_page(c));
                let records = self.process_members(ctx, page);
                Ok(ProcessStreamResult::from_records(records).with_next_page(next))
            }
            SlackStreamKind::Channel { channel_id } => {
                let channel = ctx
                    .data
                    .channel(channel_id)
                    .cloned()
                    .ok_or_else(|| Error::Fatal(format!("unknown slack channel {channel_id}")))?;
                let page = self
                    .api
                    .channel_history(&ctx.data.token, channel_id, cursor, limit)
                    .await?;
                Self::note_quota(&mut ctx.data, &page, "conversations.history");

                let placement = MessagePlacement {
                    channel_id,
                    channel_name: &channel.name,
                    thread: None,
                };
                let records = self.convert_messages(ctx, &page.items, &placement);
                let threads = page
                    .items
                    .iter()
                    .filter(|m| m.has_thread() && !m.is_bot())
                    .map(|m| {
                        let placeholder = m
                            .text
                            .as_deref()
                            .map(|t| rewrite_mentions(t, &ctx.data.members))
                            .unwrap_or_default();
                        Stream::root(
                            SlackStreamKind::Thread {
                                channel_id: channel_id.clone(),
                                channel_name: channel.name.clone(),
                                thread_id: m.ts.clone(),
                                placeholder,
                            },
                            stream.is_new() || channel.new,
                        )
                    })
                    .collect();
                let next = page.next_cursor.as_deref().map(|c| stream.next_page(c));
                Ok(ProcessStreamResult::from_records(records)
                    .with_new_streams(threads)
                    .with_next_page(next))
            }
            SlackStreamKind::Thread {
                channel_id,
                channel_name,
                thread_id,
                placeholder,
            } => {
                let page = self
                    .api
                    .thread_replies(&ctx.data.token, channel_id, thread_id, cursor, limit)
                    .await?;
                Self::note_quota(&mut ctx.data, &page, "conversations.replies");

                // The parent is returned as the first reply; it was already
                // recorded from the channel history.
                let replies: Vec<_> = page
                    .items
                    .iter()
                    .filter(|m| m.ts != *thread_id)
                    .cloned()
                    .collect();
                let placement = MessagePlacement {
                    channel_id,
                    channel_name,
                    thread: Some((thread_id.as_str(), placeholder.as_str())),
                };
                let records = self.convert_messages(ctx, &replies, &placement);
                let next = page.next_cursor.as_deref().map(|c| stream.next_page(c));
                Ok(ProcessStreamResult::from_records(records).with_next_page(next))
            }
        }
    }

    #[instrument(level = "debug", skip_all)]
    async fn postprocess(
        &self,
        ctx: &mut PipelineContext<SlackPipelineData>,
        failed_streams: &[Stream<SlackStreamKind>],
    ) -> Result<serde_json::Value> {
        let mut channels = Vec::with_capacity(ctx.data.channels.len());
        for c in &ctx.data.channels {
            let failed = failed_streams
                .iter()
                .any(|s| s.kind.channel_id() == Some(c.id.as_str()));
            if c.new && failed {
                tracing::warn!(
                    channel_id = %c.id,
                    channel = %c.name,
                    "new channel not fully synced, will retry next run"
                );
                continue;
            }
            channels.push(KnownChannel {
                id: c.id.clone(),
                name: c.name.clone(),
            });
        }
        let settings = SlackSettings {
            channels,
            members: ctx.data.members.clone(),
            other: ctx.data.other_settings.clone(),
        };
        serde_json::to_value(settings).map_err(|e| Error::backend("serialize slack settings", e))
    }

    fn keep_resumed_stream(
        &self,
        ctx: &PipelineContext<SlackPipelineData>,
        stream: &Stream<SlackStreamKind>,
    ) -> bool {
        match stream.kind.channel_id() {
            Some(id) => ctx.data.channel(id).is_some(),
            None => true,
        }
    }

    fn is_processing_finished(
        &self,
        ctx: &PipelineContext<SlackPipelineData>,
        stream: &Stream<SlackStreamKind>,
        _last_operations: &[Operation],
        last_record: Option<&ActivityRecord>,
        last_record_timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        match &stream.kind {
            // A page without a single unseen member means the rest is known.
            SlackStreamKind::Members => last_record.is_none(),
            SlackStreamKind::Channel { channel_id } => {
                let new = stream.is_new() || ctx.data.channel(channel_id).is_some_and(|c| c.new);
                self.policy
                    .is_stream_finished(ctx.job.start_timestamp, new, last_record_timestamp)
            }
            SlackStreamKind::Thread { .. } => self.policy.is_stream_finished(
                ctx.job.start_timestamp,
                stream.is_new(),
                last_record_timestamp,
            ),
        }
    }
}
