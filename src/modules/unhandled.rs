use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use super::BotModule;
use crate::engine::BotEngine;
use crate::pipeline::PreprocessedMessage;
use crate::response::{Reply, Response};

#[derive(Debug, Default, Deserialize)]
struct RuleOptions {
    replay_percentage: Option<i64>,
}

/// Canned replies, loaded from `[paths].unhandled_msg_mod_config_file`
#[derive(Debug, Default, Deserialize)]
struct Rules {
    #[serde(default)]
    options: RuleOptions,
    mentioned: Option<Vec<String>>,
    not_mentioned: Option<Vec<String>>,
}

fn load_rules(path: &Path) -> Result<Rules> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse rules: {}", path.display()))
}

/// Answers messages no other module handled
pub struct UnhandledMsgModule {
    rules: OnceLock<Rules>,
}

impl UnhandledMsgModule {
    pub fn new() -> Self {
        Self {
            rules: OnceLock::new(),
        }
    }

    /// Roll 0..=100 against the replay percentage. Kept sync so the
    /// thread-local rng never lives across an await.
    fn should_replay(&self, rules: &Rules) -> bool {
        match rules.options.replay_percentage {
            Some(percentage) => rand::thread_rng().gen_range(0..=100) <= percentage.min(100),
            None => false,
        }
    }

    fn pick_line(lines: Option<&Vec<String>>) -> Option<String> {
        lines?.choose(&mut rand::thread_rng()).cloned()
    }
}

impl Default for UnhandledMsgModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BotModule for UnhandledMsgModule {
    fn name(&self) -> &str {
        "unhandled_msg_mod"
    }

    fn description(&self) -> &str {
        "Handles messages that no other module handled"
    }

    async fn on_registered(&self, engine: &Arc<BotEngine>) -> Result<()> {
        let rules = match engine.config().path("unhandled_msg_mod_config_file") {
            Some(path) => match load_rules(&path) {
                Ok(rules) => rules,
                Err(e) => {
                    warn!("[{}] {:#}", self.name(), e);
                    Rules::default()
                }
            },
            None => Rules::default(),
        };
        if self.rules.set(rules).is_err() {
            warn!("[{}] already initialized, keeping the first rules", self.name());
            return Ok(());
        }
        info!("[{}] module initialized", self.name());
        Ok(())
    }

    async fn on_message(
        &self,
        engine: &Arc<BotEngine>,
        msg: &PreprocessedMessage,
    ) -> Result<Option<Reply>> {
        if !msg.is_message || msg.is_from(engine.identity()) {
            return Ok(None);
        }
        let (Some(channel_id), Some(user_id)) = (&msg.channel_id, &msg.from_user_id) else {
            return Ok(None);
        };
        let Some((member, _)) = engine.member_by_id(user_id).await else {
            return Ok(None);
        };
        let Some(rules) = self.rules.get() else {
            return Ok(None);
        };
        let user_name = &member.display_name;

        if msg.is_bot_mentioned && self.should_replay(rules) {
            let original = msg
                .raw
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default();
            let text = original.replace(
                &format!("<@{}>", engine.identity().id),
                &format!("@{}", user_name),
            );
            return Ok(Some(Reply::Send(Response::text(channel_id.as_str(), text))));
        }

        let lines = if msg.is_bot_mentioned {
            rules.mentioned.as_ref()
        } else {
            rules.not_mentioned.as_ref()
        };
        Ok(Self::pick_line(lines).map(|line| {
            Reply::Send(Response::text(
                channel_id.as_str(),
                line.replace("$(user)", user_name),
            ))
        }))
    }
}
