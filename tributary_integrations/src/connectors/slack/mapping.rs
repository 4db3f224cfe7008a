//! Slack payloads to canonical activity records.

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tributary_core::models::{ActivityRecord, MemberRecord, Platform, TenantId};
use tributary_core::{Error, Result};

use super::api::SlackMessage;

static MENTION: LazyLock<Regex> = LazyLock::new(|| {
    // <@U123>, <@!U123>, <@U123|ann>
    Regex::new(r"<@!?([^>|]+)(?:\|[^>]*)?>").expect("mention regex is valid")
});

/// Replace user mentions with `@username`, or `@mention` when the user is
/// not known.
pub fn rewrite_mentions(text: &str, members: &BTreeMap<String, String>) -> String {
    MENTION
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = members
                .get(&caps[1])
                .map(String::as_str)
                .unwrap_or("mention");
            format!("@{name}")
        })
        .into_owned()
}

/// Slack timestamps are `"<unix seconds>.<micros>"` strings.
pub fn parse_ts(ts: &str) -> Result<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs
        .parse()
        .map_err(|_| Error::MalformedRecord(format!("invalid slack ts: {ts}")))?;
    let micros: u32 = format!("{frac:0<6}")
        .get(..6)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::MalformedRecord(format!("invalid slack ts: {ts}")))?;
    Utc.timestamp_opt(secs, micros * 1_000)
        .single()
        .ok_or_else(|| Error::MalformedRecord(format!("slack ts out of range: {ts}")))
}

/// Link to a message in the workspace, when the workspace URL is known.
pub fn permalink(workspace_url: Option<&str>, channel_id: &str, ts: &str) -> Option<String> {
    let base = workspace_url?.trim_end_matches('/');
    Some(format!("{base}/archives/{channel_id}/p{}", ts.replace('.', "")))
}

pub fn member_record(user_id: &str, username: &str) -> MemberRecord {
    MemberRecord {
        username: username.to_string(),
        source_id: user_id.to_string(),
        attributes: serde_json::json!({ "sourceId": { "slack": user_id } }),
    }
}

/// Where a message was found.
pub struct MessagePlacement<'a> {
    pub channel_id: &'a str,
    pub channel_name: &'a str,
    /// Parent thread id and its (mention-rewritten) opening text.
    pub thread: Option<(&'a str, &'a str)>,
}

/// Convert a human message by a known member. Returns `Ok(None)` for
/// messages that are skipped (bots, unknown authors, no author).
pub fn message_activity(
    tenant_id: TenantId,
    message: &SlackMessage,
    placement: &MessagePlacement<'_>,
    members: &BTreeMap<String, String>,
    workspace_url: Option<&str>,
) -> Result<Option<ActivityRecord>> {
    if message.is_bot() {
        return Ok(None);
    }
    let Some(user_id) = message.user.as_deref() else {
        return Ok(None);
    };
    let Some(username) = members.get(user_id) else {
        return Ok(None);
    };

    let timestamp = parse_ts(&message.ts)?;
    let body = message
        .text
        .as_deref()
        .map(|t| rewrite_mentions(t, members))
        .unwrap_or_default();
    let thread = match placement.thread {
        Some((id, placeholder)) => serde_json::json!({ "id": id, "body": placeholder }),
        None => serde_json::Value::Bool(false),
    };

    Ok(Some(ActivityRecord {
        tenant_id,
        platform: Platform::Slack,
        activity_type: "message".to_string(),
        source_id: message.ts.clone(),
        source_parent_id: placement.thread.map(|(id, _)| id.to_string()),
        timestamp,
        body: Some(body),
        url: permalink(workspace_url, placement.channel_id, &message.ts),
        channel: Some(placement.channel_name.to_string()),
        attributes: serde_json::json!({
            "thread": thread,
            "reactions": message.reactions,
            "attachments": message.files,
        }),
        member: member_record(user_id, username),
    }))
}

/// Activity recording that a member is part of the workspace.
pub fn joined_activity(
    tenant_id: TenantId,
    user_id: &str,
    username: &str,
    timestamp: DateTime<Utc>,
) -> ActivityRecord {
    ActivityRecord {
        tenant_id,
        platform: Platform::Slack,
        activity_type: "channel_joined".to_string(),
        source_id: user_id.to_string(),
        source_parent_id: None,
        timestamp,
        body: None,
        url: None,
        channel: None,
        attributes: serde_json::json!({}),
        member: member_record(user_id, username),
    }
}
