use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::BotModule;
use crate::engine::BotEngine;
use crate::pipeline::PreprocessedMessage;
use crate::response::{Reply, Response};

/// Lists the loaded modules when asked for help
pub struct HelpModule;

#[async_trait]
impl BotModule for HelpModule {
    fn name(&self) -> &str {
        "help_mod"
    }

    fn description(&self) -> &str {
        "Lists the loaded modules when the bot is mentioned with \"help\""
    }

    async fn on_registered(&self, _engine: &Arc<BotEngine>) -> Result<()> {
        Ok(())
    }

    async fn on_message(
        &self,
        engine: &Arc<BotEngine>,
        msg: &PreprocessedMessage,
    ) -> Result<Option<Reply>> {
        if !msg.is_message || !msg.is_bot_mentioned || msg.is_from(engine.identity()) {
            return Ok(None);
        }
        if !msg.has_word("help") {
            return Ok(None);
        }
        let Some(channel_id) = &msg.channel_id else {
            return Ok(None);
        };

        let mut text = String::from("Here is what I can do:\n");
        for (name, description) in engine.modules().await {
            text.push_str(&format!("• `{}`: {}\n", name, description));
        }
        Ok(Some(Reply::Send(Response::text(channel_id.as_str(), text))))
    }
}
