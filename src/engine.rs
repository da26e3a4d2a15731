use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::directory::{Channel, DirectoryCache, Member};
use crate::dispatcher::ResponseDispatcher;
use crate::modules::{BotModule, ModuleRegistry};
use crate::pipeline::{self, PreprocessedMessage};
use crate::platform::{BotIdentity, PlatformGateway};
use crate::prefs::PreferencesStore;
use crate::response::{Reply, Response};
use crate::scheduler::{TimerFuture, TimerScheduler};
use crate::users::{load_user_list, User};

/// Owns all shared bot state and runs the main read/dispatch/drain loop.
/// Modules and timer tasks receive it explicitly.
pub struct BotEngine {
    config: Config,
    identity: BotIdentity,
    gateway: Option<Arc<dyn PlatformGateway>>,
    directory: DirectoryCache,
    dispatcher: ResponseDispatcher,
    scheduler: TimerScheduler,
    prefs: PreferencesStore,
    registry: RwLock<ModuleRegistry>,
    connected: AtomicBool,
}

async fn resolve_identity(config: &Config, gateway: Option<&dyn PlatformGateway>) -> BotIdentity {
    if let Some(gateway) = gateway {
        match gateway.identity().await {
            Ok(identity) => return identity,
            Err(e) => warn!("Failed to resolve bot identity, using config: {:#}", e),
        }
    }
    BotIdentity {
        id: config.bot.id.clone(),
        display_name: config.bot.name.clone(),
    }
}

impl BotEngine {
    /// Resolve the bot identity and load the directory. A `None` gateway
    /// runs the engine offline.
    pub async fn start(config: Config, gateway: Option<Arc<dyn PlatformGateway>>) -> Arc<Self> {
        let identity = resolve_identity(&config, gateway.as_deref()).await;
        info!("Bot identity: {} ({})", identity.display_name, identity.id);

        let users = load_user_list(config.path("user_config_file").as_deref());
        let directory =
            DirectoryCache::new(gateway.clone(), users, config.history_refresh_timeout());
        directory.refresh().await;

        let prefs = PreferencesStore::new(config.prefs_directory());
        let dispatcher = ResponseDispatcher::new(config.min_post_delay(), Some(prefs.clone()));

        Arc::new(Self {
            config,
            identity,
            gateway,
            directory,
            dispatcher,
            scheduler: TimerScheduler::new(),
            prefs,
            registry: RwLock::new(ModuleRegistry::new()),
            connected: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    pub fn prefs(&self) -> &PreferencesStore {
        &self.prefs
    }

    /// False when running without a platform gateway
    pub fn is_online(&self) -> bool {
        self.gateway.is_some()
    }

    // ── Modules ─────────────────────────────────────────────────

    /// Add a module unless disabled in config, then run its
    /// `on_registered`. Returns whether the module was registered.
    pub async fn register_module(self: &Arc<Self>, module: Arc<dyn BotModule>) -> bool {
        let name = module.name().to_string();
        if name.is_empty() {
            warn!("Skipping module with no name");
            return false;
        }
        if self.config.is_module_disabled(&name) {
            info!("Skip disabled module \"{}\"", name);
            return false;
        }

        {
            let mut registry = self.registry.write().await;
            if name == self.config.modules.fallback {
                registry.set_fallback(Arc::clone(&module));
            } else {
                registry.register(Arc::clone(&module));
            }
        }
        info!("Module \"{}\" loaded", name);

        if let Err(e) = module.on_registered(self).await {
            error!("[{}] initialization failed: {:#}", name, e);
        }
        true
    }

    /// Name and description of each registered module
    pub async fn modules(&self) -> Vec<(String, String)> {
        self.registry
            .read()
            .await
            .all()
            .map(|m| (m.name().to_string(), m.description().to_string()))
            .collect()
    }

    /// Offer a message to the registered modules, fallback last
    pub async fn dispatch(self: &Arc<Self>, msg: &PreprocessedMessage) -> Option<Reply> {
        // Snapshot so no lock is held while modules run
        let registry = self.registry.read().await.clone();
        registry.dispatch(self, msg).await
    }

    // ── Timers ──────────────────────────────────────────────────

    /// Start calling `on_timer(timer_id)` on the named module every
    /// `interval`. Returns `false` if no such module is registered.
    pub async fn register_timer(
        self: &Arc<Self>,
        module_name: &str,
        timer_id: &str,
        interval: Duration,
    ) -> bool {
        let Some(module) = self.registry.read().await.get(module_name) else {
            warn!(
                "Cannot register timer '{}' for unknown module '{}'",
                timer_id, module_name
            );
            return false;
        };

        let engine = Arc::clone(self);
        let id = timer_id.to_string();
        self.scheduler
            .add_timer(
                &format!("{}/{}", module_name, timer_id),
                interval,
                move || -> TimerFuture {
                    let engine = Arc::clone(&engine);
                    let module = Arc::clone(&module);
                    let id = id.clone();
                    Box::pin(async move { module.on_timer(&id, &engine).await })
                },
            )
            .await;
        true
    }

    /// Number of timer tasks started so far
    pub async fn timer_count(&self) -> usize {
        self.scheduler.timer_count().await
    }

    // ── Directory ───────────────────────────────────────────────

    /// Member and bot-local user for a platform id
    pub async fn member_by_id(&self, id: &str) -> Option<(Arc<Member>, Option<Arc<User>>)> {
        self.directory.resolve_member_by_id(id).await
    }

    pub async fn member_by_name(&self, name: &str) -> Option<(Arc<Member>, Option<Arc<User>>)> {
        self.directory.resolve_member_by_name(name).await
    }

    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.directory.list_channels().await
    }

    pub async fn channel_by_id(&self, id: &str) -> Option<Arc<Channel>> {
        self.directory.channel_by_id(id).await
    }

    pub async fn channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        self.directory.channel_by_name(name).await
    }

    /// Cached channel metadata; `force` refetches
    pub async fn channel_info(&self, id_or_name: &str, force: bool) -> Option<Arc<Value>> {
        self.directory.channel_info(id_or_name, force).await
    }

    pub async fn channel_history(
        &self,
        name: &str,
        force: bool,
        params: &[(String, String)],
    ) -> Option<Arc<Value>> {
        self.directory.channel_history(name, force, params).await
    }

    /// Reload members and channels from the platform
    pub async fn refresh_directory(&self) -> bool {
        self.directory.refresh().await
    }

    // ── Responses ───────────────────────────────────────────────

    /// Queue a response behind everything already waiting
    pub async fn queue_response(&self, response: Response) {
        self.dispatcher.enqueue(response).await;
    }

    /// Queue a response ahead of everything already waiting
    pub async fn queue_response_front(&self, response: Response) {
        self.dispatcher.enqueue_front(response).await;
    }

    /// Number of responses not yet sent
    pub async fn pending_responses(&self) -> usize {
        self.dispatcher.len().await
    }

    // ── Main loop ───────────────────────────────────────────────

    /// Turn a raw platform event into a message record
    pub async fn preprocess(&self, raw: Value) -> Option<PreprocessedMessage> {
        pipeline::preprocess(raw, &self.directory, &self.identity, &self.config).await
    }

    /// Preprocess one raw event, dispatch it, and queue the reply.
    pub async fn handle_event(self: &Arc<Self>, raw: Value) {
        let Some(msg) = self.preprocess(raw).await else {
            return;
        };
        if let Some(Reply::Send(response)) = self.dispatch(&msg).await {
            self.queue_response(response).await;
        }
    }

    async fn connect(&self, gateway: &dyn PlatformGateway) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        match gateway.connect_realtime().await {
            Ok(()) => {
                info!("Connected to realtime events");
                self.connected.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("Realtime connection failed: {:#}", e);
                false
            }
        }
    }

    /// One main-loop iteration: read events, dispatch them, run one drain
    /// pass. Gateway failures are logged; only engine faults are returned.
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let Some(gateway) = self.gateway.clone() else {
            return Ok(());
        };

        if self.connect(gateway.as_ref()).await {
            match gateway.read_realtime_events().await {
                Ok(events) => {
                    for raw in events {
                        self.handle_event(raw).await;
                    }
                }
                Err(e) => warn!("Failed to read events: {:#}", e),
            }
        }

        let remaining = self.dispatcher.drain_and_send(gateway.as_ref()).await?;
        if remaining > 0 {
            debug!("{} response(s) waiting", remaining);
        }
        Ok(())
    }

    /// Raise the global stop signal.
    pub fn stop(&self) {
        info!("Stopping bot");
        self.scheduler.stop();
    }

    /// Run until [`stop`](Self::stop) is called. A main-cycle fault stops
    /// all timers and is returned.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if !self.is_online() {
            info!("Offline mode: realtime read and send disabled, timers keep running");
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.scheduler.stopped() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Main cycle failed: {:#}", e);
                        self.scheduler.shutdown().await;
                        return Err(e);
                    }
                }
            }
        }

        self.scheduler.shutdown().await;
        info!("Bot stopped");
        Ok(())
    }
}
