pub mod slack;

#[cfg(test)]
pub mod testing;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Who the bot is on the platform. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: String,
    pub display_name: String,
}

/// Arguments of a file upload
#[derive(Debug, Clone)]
pub struct FileUpload<'a> {
    pub channel_id: &'a str,
    pub content: &'a str,
    pub file_type: &'a str,
    pub file_name: &'a str,
    pub title: &'a str,
    pub comment: Option<&'a str>,
}

/// Capability surface the engine needs from a team messaging platform.
///
/// Every call may fail on network or auth errors. Implementations report
/// those as `Err`; the engine treats any error as "gateway unavailable" and
/// degrades to offline behavior for that operation.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Resolve the bot's own identity
    async fn identity(&self) -> Result<BotIdentity>;

    async fn list_members(&self) -> Result<Vec<Value>>;

    /// Public channels
    async fn list_channels(&self) -> Result<Vec<Value>>;

    /// Private channels and groups
    async fn list_groups(&self) -> Result<Vec<Value>>;

    async fn channel_info(&self, channel_id: &str) -> Result<Value>;

    async fn channel_history(&self, channel_id: &str, params: &[(String, String)])
        -> Result<Value>;

    async fn connect_realtime(&self) -> Result<()>;

    /// Events received since the previous read, oldest first
    async fn read_realtime_events(&self) -> Result<Vec<Value>>;

    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        attachments: Option<&Value>,
    ) -> Result<()>;

    async fn upload_file(&self, upload: &FileUpload<'_>) -> Result<()>;
}
