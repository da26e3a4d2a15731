use serde_json::Value;

use crate::config::Config;
use crate::directory::DirectoryCache;
use crate::platform::BotIdentity;

/// Read-only view of one inbound event
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedMessage {
    pub raw: Value,
    pub is_message: bool,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub from_user_id: Option<String>,
    pub from_user_name: Option<String>,
    /// Whitespace-separated words as typed
    pub words: Vec<String>,
    pub lower_words: Vec<String>,
    /// Words joined by single spaces
    pub text: String,
    pub lower_text: String,
    pub is_bot_mentioned: bool,
}

impl PreprocessedMessage {
    fn event(raw: Value) -> Self {
        Self {
            raw,
            is_message: false,
            channel_id: None,
            channel_name: None,
            from_user_id: None,
            from_user_name: None,
            words: Vec::new(),
            lower_words: Vec::new(),
            text: String::new(),
            lower_text: String::new(),
            is_bot_mentioned: false,
        }
    }

    pub fn is_from(&self, identity: &BotIdentity) -> bool {
        self.from_user_id.as_deref() == Some(identity.id.as_str())
    }

    /// True if any lower-cased word equals `word`
    pub fn has_word(&self, word: &str) -> bool {
        let word = word.to_lowercase();
        self.lower_words.iter().any(|w| *w == word)
    }
}

fn is_plain_message(raw: &Value) -> bool {
    raw.get("type").and_then(Value::as_str) == Some("message")
        && raw.get("subtype").is_none()
        && raw.get("channel").and_then(Value::as_str).is_some()
}

fn strip_punctuation(word: &str) -> &str {
    word.trim_end_matches([':', ',', '.', '!', '?'])
}

/// Name tokens are matched lower-cased first, then the `<@ID>` form
/// case-sensitively against the raw words.
fn mentions_bot(words: &[String], lower_words: &[String], identity: &BotIdentity) -> bool {
    let name = identity.display_name.to_lowercase();
    if !name.is_empty() {
        let at_name = format!("@{}", name);
        let bracketed_name = format!("<@{}>", name);
        let hit = lower_words.iter().any(|w| {
            let w = strip_punctuation(w);
            w == name || w == at_name || w == bracketed_name
        });
        if hit {
            return true;
        }
    }

    if identity.id.is_empty() {
        return false;
    }
    let bracketed_id = format!("<@{}>", identity.id);
    words
        .iter()
        .any(|w| strip_punctuation(w) == bracketed_id)
}

/// Build a [`PreprocessedMessage`] from a raw platform event.
///
/// Returns `None` for events that are not JSON objects with a `type`, and
/// for messages on disabled channels.
pub async fn preprocess(
    raw: Value,
    directory: &DirectoryCache,
    identity: &BotIdentity,
    config: &Config,
) -> Option<PreprocessedMessage> {
    raw.get("type").and_then(Value::as_str)?;

    if !is_plain_message(&raw) {
        return Some(PreprocessedMessage::event(raw));
    }

    let channel_id = raw.get("channel").and_then(Value::as_str)?.to_string();
    let channel_name = match directory.channel_by_id(&channel_id).await {
        Some(channel) => {
            if config.is_channel_disabled(&channel.id, &channel.name) {
                return None;
            }
            Some(channel.name.clone())
        }
        None => {
            if config.is_channel_disabled(&channel_id, "") {
                return None;
            }
            None
        }
    };

    let from_user_id = raw
        .get("user")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let from_user_name = match &from_user_id {
        Some(id) => directory
            .resolve_member_by_id(id)
            .await
            .map(|(member, _)| member.display_name.clone()),
        None => None,
    };

    let body = raw.get("text").and_then(Value::as_str).unwrap_or_default();
    let words: Vec<String> = body.split_whitespace().map(ToOwned::to_owned).collect();
    let lower_words: Vec<String> = body
        .to_lowercase()
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect();
    let is_bot_mentioned = mentions_bot(&words, &lower_words, identity);
    let text = words.join(" ");
    let lower_text = lower_words.join(" ");

    Some(PreprocessedMessage {
        raw,
        is_message: true,
        channel_id: Some(channel_id),
        channel_name,
        from_user_id,
        from_user_name,
        words,
        lower_words,
        text,
        lower_text,
        is_bot_mentioned,
    })
}
