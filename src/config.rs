use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Bot token for the platform Web API. Empty means offline.
    #[serde(default)]
    pub token: String,
}

/// Identity used when the platform cannot tell us who we are.
#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub offline: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_min_post_delay_secs")]
    pub min_post_delay_secs: f64,
    #[serde(default = "default_history_refresh_timeout_secs")]
    pub history_refresh_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrefsConfig {
    #[serde(default = "default_prefs_dir")]
    pub directory: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModulesConfig {
    /// Module invoked only when no other module handled a message
    #[serde(default = "default_fallback_module")]
    pub fallback: String,
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelsConfig {
    /// Channel ids or names whose events are discarded
    #[serde(default)]
    pub disabled: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default = "default_bot_config")]
    pub bot: BotConfig,
    #[serde(default = "default_engine_config")]
    pub engine: EngineConfig,
    #[serde(default = "default_prefs_config")]
    pub prefs: PrefsConfig,
    #[serde(default = "default_modules_config")]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub paths: HashMap<String, PathBuf>,
    /// Directory of the loaded file; relative paths resolve against it.
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_bot_name() -> String {
    "bot".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_min_post_delay_secs() -> f64 {
    1.0
}

fn default_history_refresh_timeout_secs() -> u64 {
    300
}

fn default_prefs_dir() -> PathBuf {
    PathBuf::from("prefs")
}

fn default_fallback_module() -> String {
    "unhandled_msg_mod".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    3600
}

fn default_bot_config() -> BotConfig {
    BotConfig {
        name: default_bot_name(),
        id: String::new(),
    }
}

fn default_engine_config() -> EngineConfig {
    EngineConfig {
        offline: false,
        tick_interval_ms: default_tick_interval_ms(),
        min_post_delay_secs: default_min_post_delay_secs(),
        history_refresh_timeout_secs: default_history_refresh_timeout_secs(),
    }
}

fn default_prefs_config() -> PrefsConfig {
    PrefsConfig {
        directory: default_prefs_dir(),
    }
}

fn default_modules_config() -> ModulesConfig {
    ModulesConfig {
        fallback: default_fallback_module(),
        disabled: Vec::new(),
        heartbeat_interval_secs: default_heartbeat_interval_secs(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.base_dir = path
            .canonicalize()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(config)
    }

    /// Parse and validate without touching the filesystem. Relative paths
    /// resolve against the current directory.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.base_dir = PathBuf::from(".");
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.tick_interval_ms == 0 {
            anyhow::bail!("engine.tick_interval_ms must be greater than zero");
        }
        let delay = self.engine.min_post_delay_secs;
        if !delay.is_finite() || delay < 0.0 {
            anyhow::bail!(
                "engine.min_post_delay_secs must be a non-negative number, got {}",
                delay
            );
        }
        if self.modules.heartbeat_interval_secs == 0 {
            anyhow::bail!("modules.heartbeat_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Offline when explicitly switched off or when no token is configured.
    pub fn is_offline(&self) -> bool {
        self.engine.offline || self.api.token.trim().is_empty()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.engine.tick_interval_ms)
    }

    pub fn min_post_delay(&self) -> Duration {
        Duration::from_secs_f64(self.engine.min_post_delay_secs)
    }

    pub fn history_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.history_refresh_timeout_secs)
    }

    /// Resolve a path against the config file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Named entry from `[paths]`, resolved. Lookup is case-insensitive.
    pub fn path(&self, name: &str) -> Option<PathBuf> {
        let name = name.to_lowercase();
        self.paths
            .iter()
            .find(|(key, value)| key.to_lowercase() == name && !value.as_os_str().is_empty())
            .map(|(_, value)| self.resolve_path(value))
    }

    pub fn prefs_directory(&self) -> PathBuf {
        self.resolve_path(&self.prefs.directory)
    }

    pub fn is_module_disabled(&self, name: &str) -> bool {
        self.modules
            .disabled
            .iter()
            .any(|m| m.eq_ignore_ascii_case(name))
    }

    /// A channel is disabled when either its id or its name is listed.
    pub fn is_channel_disabled(&self, id: &str, name: &str) -> bool {
        self.channels
            .disabled
            .iter()
            .any(|c| c == id || c.trim_start_matches('#') == name)
    }
}
