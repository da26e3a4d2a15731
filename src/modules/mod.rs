pub mod heartbeat;
pub mod help;
pub mod unhandled;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::engine::BotEngine;
use crate::pipeline::PreprocessedMessage;
use crate::response::Reply;
use crate::scheduler::panic_message;

/// A pluggable behavior. Modules keep their own state behind interior
/// mutability; the engine may call them from several tasks at once.
#[async_trait]
pub trait BotModule: Send + Sync {
    /// Unique name, also used in configuration
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Called once at startup, in registration order, after the module is
    /// in the registry.
    async fn on_registered(&self, engine: &Arc<BotEngine>) -> Result<()>;

    /// `None` passes the message on to the next module.
    async fn on_message(
        &self,
        engine: &Arc<BotEngine>,
        msg: &PreprocessedMessage,
    ) -> Result<Option<Reply>>;

    async fn on_timer(&self, timer_id: &str, _engine: &Arc<BotEngine>) -> Result<()> {
        debug!("[{}] ignoring timer '{}'", self.name(), timer_id);
        Ok(())
    }
}

/// Ordered modules plus an optional fallback
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn BotModule>>,
    fallback: Option<Arc<dyn BotModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn BotModule>) {
        self.modules.push(module);
    }

    pub fn set_fallback(&mut self, module: Arc<dyn BotModule>) {
        if let Some(previous) = self.fallback.replace(module) {
            warn!("Fallback module '{}' replaced", previous.name());
        }
    }

    /// Look up a module by name, the fallback included
    pub fn get(&self, name: &str) -> Option<Arc<dyn BotModule>> {
        self.all().find(|m| m.name() == name).cloned()
    }

    /// Registration order, fallback last
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn BotModule>> + '_ {
        self.modules.iter().chain(self.fallback.iter())
    }

    pub fn len(&self) -> usize {
        self.modules.len() + usize::from(self.fallback.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer the message to each module in order; the first reply (a
    /// [`Reply::Silent`] included) wins. The fallback only sees messages
    /// no other module answered. A failing or panicking module counts as no
    /// answer.
    pub async fn dispatch(
        &self,
        engine: &Arc<BotEngine>,
        msg: &PreprocessedMessage,
    ) -> Option<Reply> {
        for module in &self.modules {
            if let Some(reply) = offer(module.as_ref(), engine, msg).await {
                return Some(reply);
            }
        }
        match &self.fallback {
            Some(fallback) => offer(fallback.as_ref(), engine, msg).await,
            None => None,
        }
    }
}

/// Errors and panics both count as no answer.
async fn offer(
    module: &dyn BotModule,
    engine: &Arc<BotEngine>,
    msg: &PreprocessedMessage,
) -> Option<Reply> {
    match AssertUnwindSafe(module.on_message(engine, msg))
        .catch_unwind()
        .await
    {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            warn!("[{}] failed to handle message: {:#}", module.name(), e);
            None
        }
        Err(panic) => {
            error!(
                "[{}] panicked while handling a message: {}",
                module.name(),
                panic_message(&*panic)
            );
            None
        }
    }
}

/// Register the built-in modules in their fixed order.
pub async fn register_builtin(engine: &Arc<BotEngine>) {
    let modules: Vec<Arc<dyn BotModule>> = vec![
        Arc::new(help::HelpModule),
        Arc::new(heartbeat::HeartbeatModule::new()),
        Arc::new(unhandled::UnhandledMsgModule::new()),
    ];
    for module in modules {
        engine.register_module(module).await;
    }
}
