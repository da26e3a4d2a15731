use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use teambot::config::Config;
use teambot::engine::BotEngine;
use teambot::modules;
use teambot::platform::slack::SlackGateway;
use teambot::platform::PlatformGateway;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,teambot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Bot name: {}", config.bot.name);
    info!("  Offline: {}", config.is_offline());
    info!("  Preferences: {}", config.prefs_directory().display());
    info!("  Disabled modules: {:?}", config.modules.disabled);

    let gateway: Option<Arc<dyn PlatformGateway>> = if config.is_offline() {
        None
    } else {
        Some(Arc::new(SlackGateway::new(&config.api.token)))
    };

    let engine = BotEngine::start(config, gateway).await;
    modules::register_builtin(&engine).await;

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_engine.stop(),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    info!("Bot is starting...");
    engine.run().await?;

    Ok(())
}
