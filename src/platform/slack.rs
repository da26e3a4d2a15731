use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BotIdentity, FileUpload, PlatformGateway};

/// Slack Web API base URL.
const SLACK_API_BASE: &str = "https://slack.com/api";

/// Maximum pages fetched from a paginated list call (50 × 200 entries).
const MAX_PAGES: usize = 50;

const PAGE_LIMIT: &str = "200";

/// Messages fetched per channel per poll
const HISTORY_POLL_LIMIT: &str = "100";

/// Slack Web API gateway. Realtime events are read by polling channel
/// history past a per-channel watermark.
pub struct SlackGateway {
    http: reqwest::Client,
    token: String,
    base_url: String,
    /// channel id -> ts of the newest message already delivered
    watermarks: Mutex<HashMap<String, String>>,
}

impl SlackGateway {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            base_url: SLACK_API_BASE.to_string(),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, method: &str, query: &[(&str, String)]) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Slack {} request failed", method))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        parse_api_response(method, status.is_success(), status.as_u16(), &body)
    }

    async fn post_json(&self, method: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Slack {} request failed", method))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        parse_api_response(method, status.is_success(), status.as_u16(), &text)
    }

    async fn post_form(&self, method: &str, form: &[(&str, &str)]) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await
            .with_context(|| format!("Slack {} request failed", method))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        parse_api_response(method, status.is_success(), status.as_u16(), &text)
    }

    /// Follow `response_metadata.next_cursor` until exhausted or the page cap.
    async fn list_paginated(
        &self,
        method: &str,
        field: &str,
        extra: &[(&str, String)],
    ) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            pages += 1;
            let mut query: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
            query.extend(extra.iter().cloned());
            if let Some(ref next) = cursor {
                query.push(("cursor", next.clone()));
            }

            let data = self.get(method, &query).await?;
            if let Some(page) = data.get(field).and_then(Value::as_array) {
                items.extend(page.iter().cloned());
            }

            cursor = next_cursor(&data);
            if cursor.is_none() {
                break;
            }
            if pages >= MAX_PAGES {
                warn!(method, pages, "Slack: page limit reached; list may be incomplete");
                break;
            }
        }

        Ok(items)
    }

    async fn list_conversations(&self, types: &str) -> Result<Vec<Value>> {
        self.list_paginated(
            "conversations.list",
            "channels",
            &[
                ("types", types.to_string()),
                ("exclude_archived", "true".to_string()),
            ],
        )
        .await
    }

    async fn poll_channel(&self, channel_id: &str, oldest: &str) -> Result<Vec<Value>> {
        let data = self
            .get(
                "conversations.history",
                &[
                    ("channel", channel_id.to_string()),
                    ("oldest", oldest.to_string()),
                    ("limit", HISTORY_POLL_LIMIT.to_string()),
                ],
            )
            .await?;

        let mut events = Vec::new();
        if let Some(messages) = data.get("messages").and_then(Value::as_array) {
            // Newest first on the wire
            for msg in messages.iter().rev() {
                let ts = msg.get("ts").and_then(Value::as_str).unwrap_or("");
                if ts.is_empty() || ts <= oldest {
                    continue;
                }
                let mut event = msg.clone();
                if let Some(obj) = event.as_object_mut() {
                    obj.entry("type").or_insert_with(|| json!("message"));
                    obj.insert("channel".to_string(), json!(channel_id));
                }
                events.push(event);
            }
        }
        Ok(events)
    }
}

/// Turn a Web API reply into its JSON body, failing on HTTP errors and on
/// `{"ok": false}` payloads (Slack reports most errors with status 200).
fn parse_api_response(method: &str, success: bool, status: u16, body: &str) -> Result<Value> {
    if !success {
        anyhow::bail!("Slack {} failed ({}): {}", method, status, body);
    }
    let data: Value = serde_json::from_str(body)
        .with_context(|| format!("Slack {}: response is not valid JSON", method))?;
    if data.get("ok") == Some(&Value::Bool(false)) {
        let err = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        anyhow::bail!("Slack {} failed: {}", method, err);
    }
    Ok(data)
}

fn next_cursor(data: &Value) -> Option<String> {
    data.get("response_metadata")
        .and_then(|rm| rm.get("next_cursor"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(ToOwned::to_owned)
}

/// Ids of conversations the bot belongs to
fn member_channel_ids(channels: &[Value]) -> Vec<String> {
    channels
        .iter()
        .filter(|c| c.get("is_member").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|c| c.get("id").and_then(Value::as_str))
        .map(ToOwned::to_owned)
        .collect()
}

fn now_ts() -> String {
    format!("{}.000000", chrono::Utc::now().timestamp())
}

#[async_trait]
impl PlatformGateway for SlackGateway {
    async fn identity(&self) -> Result<BotIdentity> {
        let data = self.post_form("auth.test", &[]).await?;
        let id = data
            .get("user_id")
            .and_then(Value::as_str)
            .context("auth.test response has no user_id")?;
        let name = data.get("user").and_then(Value::as_str).unwrap_or(id);
        Ok(BotIdentity {
            id: id.to_string(),
            display_name: name.to_string(),
        })
    }

    async fn list_members(&self) -> Result<Vec<Value>> {
        self.list_paginated("users.list", "members", &[]).await
    }

    async fn list_channels(&self) -> Result<Vec<Value>> {
        self.list_conversations("public_channel").await
    }

    async fn list_groups(&self) -> Result<Vec<Value>> {
        self.list_conversations("private_channel,mpim").await
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Value> {
        let data = self
            .get("conversations.info", &[("channel", channel_id.to_string())])
            .await?;
        data.get("channel")
            .cloned()
            .context("conversations.info response has no channel")
    }

    async fn channel_history(
        &self,
        channel_id: &str,
        params: &[(String, String)],
    ) -> Result<Value> {
        let mut query: Vec<(&str, String)> = vec![("channel", channel_id.to_string())];
        query.extend(params.iter().map(|(k, v)| (k.as_str(), v.clone())));
        self.get("conversations.history", &query).await
    }

    async fn connect_realtime(&self) -> Result<()> {
        self.post_form("auth.test", &[]).await?;

        let mut channels = self.list_channels().await?;
        channels.extend(self.list_groups().await?);
        let ids = member_channel_ids(&channels);

        let start = now_ts();
        let mut watermarks = self.watermarks.lock().await;
        for id in ids {
            watermarks.entry(id).or_insert_with(|| start.clone());
        }
        info!("Slack: polling {} channel(s) for events", watermarks.len());
        Ok(())
    }

    async fn read_realtime_events(&self) -> Result<Vec<Value>> {
        let targets: Vec<(String, String)> = {
            let watermarks = self.watermarks.lock().await;
            watermarks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut events = Vec::new();
        for (channel_id, oldest) in targets {
            match self.poll_channel(&channel_id, &oldest).await {
                Ok(batch) => {
                    if let Some(newest) = batch
                        .iter()
                        .filter_map(|e| e.get("ts").and_then(Value::as_str))
                        .max()
                    {
                        self.watermarks
                            .lock()
                            .await
                            .insert(channel_id.clone(), newest.to_string());
                    }
                    events.extend(batch);
                }
                Err(e) => warn!("Slack poll error for channel {}: {:#}", channel_id, e),
            }
        }

        events.sort_by(|a, b| {
            let ta = a.get("ts").and_then(Value::as_str).unwrap_or("");
            let tb = b.get("ts").and_then(Value::as_str).unwrap_or("");
            ta.cmp(tb)
        });
        if !events.is_empty() {
            debug!("Slack: read {} event(s)", events.len());
        }
        Ok(events)
    }

    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        attachments: Option<&Value>,
    ) -> Result<()> {
        let mut body = json!({
            "channel": channel_id,
            "text": text,
            "as_user": true,
        });
        if let Some(attachments) = attachments {
            body["attachments"] = attachments.clone();
        }
        self.post_json("chat.postMessage", &body).await?;
        Ok(())
    }

    async fn upload_file(&self, upload: &FileUpload<'_>) -> Result<()> {
        let mut form = vec![
            ("channels", upload.channel_id),
            ("content", upload.content),
            ("filetype", upload.file_type),
            ("filename", upload.file_name),
            ("title", upload.title),
        ];
        if let Some(comment) = upload.comment {
            form.push(("initial_comment", comment));
        }
        self.post_form("files.upload", &form).await?;
        Ok(())
    }
}
