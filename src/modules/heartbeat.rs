use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::BotModule;
use crate::engine::BotEngine;
use crate::pipeline::PreprocessedMessage;
use crate::response::Reply;

const TIMER_ID: &str = "heartbeat";

/// Periodically logs that the bot is alive
#[derive(Default)]
pub struct HeartbeatModule {
    beats: AtomicU64,
}

impl HeartbeatModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heartbeats logged since startup
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BotModule for HeartbeatModule {
    fn name(&self) -> &str {
        "heartbeat_mod"
    }

    fn description(&self) -> &str {
        "Logs a heartbeat on a fixed interval"
    }

    async fn on_registered(&self, engine: &Arc<BotEngine>) -> Result<()> {
        let interval = Duration::from_secs(engine.config().modules.heartbeat_interval_secs);
        if !engine.register_timer(self.name(), TIMER_ID, interval).await {
            anyhow::bail!("could not register the heartbeat timer");
        }
        Ok(())
    }

    async fn on_message(
        &self,
        _engine: &Arc<BotEngine>,
        _msg: &PreprocessedMessage,
    ) -> Result<Option<Reply>> {
        Ok(None)
    }

    async fn on_timer(&self, timer_id: &str, engine: &Arc<BotEngine>) -> Result<()> {
        if timer_id == TIMER_ID {
            let beat = self.beats.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "{} is alive (heartbeat #{}), {} response(s) queued",
                engine.identity().display_name,
                beat,
                engine.pending_responses().await
            );
        }
        Ok(())
    }
}
