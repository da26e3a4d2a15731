//! Scripted in-memory gateway for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{BotIdentity, FileUpload, PlatformGateway};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Message { channel_id: String, text: String },
    Upload { channel_id: String, file_name: String, title: String },
}

#[derive(Default)]
pub struct MockGateway {
    pub members: Vec<Value>,
    pub channels: Vec<Value>,
    pub groups: Vec<Value>,
    pub infos: HashMap<String, Value>,
    pub events: Mutex<VecDeque<Vec<Value>>>,
    /// Every call, by method name, in order
    pub calls: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<Sent>>,
    pub offline: AtomicBool,
    pub fail_sends: AtomicBool,
    /// How long each send takes before it completes
    pub send_delay: Mutex<Duration>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small workspace: two members, a public and a private channel.
    pub fn workspace() -> Self {
        let mut infos = HashMap::new();
        infos.insert("C1".to_string(), json!({"id": "C1", "topic": "general talk"}));
        Self {
            members: vec![
                json!({"id": "U1", "name": "alice"}),
                json!({"id": "UBOT", "name": "bot"}),
            ],
            channels: vec![json!({"id": "C1", "name": "general"})],
            groups: vec![json!({"id": "G1", "name": "secret"})],
            infos,
            ..Self::default()
        }
    }

    pub fn push_events(&self, events: Vec<Value>) {
        self.events.lock().unwrap().push_back(events);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    async fn finish_send(&self) -> Result<()> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("ratelimited");
        }
        Ok(())
    }

    fn record(&self, method: &str) -> Result<()> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformGateway for MockGateway {
    async fn identity(&self) -> Result<BotIdentity> {
        self.record("identity")?;
        Ok(BotIdentity {
            id: "UBOT".to_string(),
            display_name: "bot".to_string(),
        })
    }

    async fn list_members(&self) -> Result<Vec<Value>> {
        self.record("list_members")?;
        Ok(self.members.clone())
    }

    async fn list_channels(&self) -> Result<Vec<Value>> {
        self.record("list_channels")?;
        Ok(self.channels.clone())
    }

    async fn list_groups(&self) -> Result<Vec<Value>> {
        self.record("list_groups")?;
        Ok(self.groups.clone())
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Value> {
        self.record("channel_info")?;
        self.infos
            .get(channel_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("channel_not_found"))
    }

    async fn channel_history(
        &self,
        channel_id: &str,
        params: &[(String, String)],
    ) -> Result<Value> {
        self.record("channel_history")?;
        let n = self.call_count("channel_history");
        Ok(json!({"channel": channel_id, "fetch": n, "params": params.len()}))
    }

    async fn connect_realtime(&self) -> Result<()> {
        self.record("connect_realtime")
    }

    async fn read_realtime_events(&self) -> Result<Vec<Value>> {
        self.record("read_realtime_events")?;
        Ok(self.events.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        _attachments: Option<&Value>,
    ) -> Result<()> {
        self.record("post_message")?;
        self.finish_send().await?;
        self.sent.lock().unwrap().push(Sent::Message {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn upload_file(&self, upload: &FileUpload<'_>) -> Result<()> {
        self.record("upload_file")?;
        self.finish_send().await?;
        self.sent.lock().unwrap().push(Sent::Upload {
            channel_id: upload.channel_id.to_string(),
            file_name: upload.file_name.to_string(),
            title: upload.title.to_string(),
        });
        Ok(())
    }
}
