use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::platform::PlatformGateway;
use crate::users::User;

/// A platform user account
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: String,
    pub display_name: String,
    pub raw: Value,
}

/// A platform conversation (public or private)
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub raw: Value,
}

/// Cached history of one channel
#[derive(Debug, Clone)]
pub struct ChannelHistoryEntry {
    pub history: Arc<Value>,
    pub refreshed_at: Instant,
}

/// Two parallel indices sharing one `Arc` per entity.
#[derive(Debug)]
struct Index<T> {
    by_id: HashMap<String, Arc<T>>,
    by_name: HashMap<String, Arc<T>>,
}

impl<T> Default for Index<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T> Index<T> {
    fn insert(&mut self, id: &str, name: &str, item: Arc<T>) {
        if !name.is_empty() {
            self.by_name.insert(name.to_string(), Arc::clone(&item));
        }
        self.by_id.insert(id.to_string(), item);
    }
}

fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

impl Member {
    fn from_raw(raw: Value) -> Option<Self> {
        let id = str_field(&raw, "id")?.to_string();
        let display_name = str_field(&raw, "name").unwrap_or_default().to_string();
        Some(Self {
            id,
            display_name,
            raw,
        })
    }
}

impl Channel {
    fn from_raw(raw: Value) -> Option<Self> {
        let id = str_field(&raw, "id")?.to_string();
        let name = str_field(&raw, "name").unwrap_or_default().to_string();
        Some(Self { id, name, raw })
    }
}

/// Member and channel lookup tables, populated from the platform.
///
/// Lookups never fail: unknown keys and an unavailable gateway both yield
/// `None`. Each table has its own lock so lazy population of one does not
/// block readers of another.
pub struct DirectoryCache {
    gateway: Option<Arc<dyn PlatformGateway>>,
    users: Vec<Arc<User>>,
    history_refresh_timeout: Duration,
    members: RwLock<Index<Member>>,
    channels: RwLock<Index<Channel>>,
    /// Keyed by channel id; names resolve to ids through the channel table
    channel_info: Mutex<HashMap<String, Arc<Value>>>,
    channel_history: Mutex<HashMap<String, ChannelHistoryEntry>>,
}

impl DirectoryCache {
    pub fn new(
        gateway: Option<Arc<dyn PlatformGateway>>,
        users: Vec<User>,
        history_refresh_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            users: users.into_iter().map(Arc::new).collect(),
            history_refresh_timeout,
            members: RwLock::new(Index::default()),
            channels: RwLock::new(Index::default()),
            channel_info: Mutex::new(HashMap::new()),
            channel_history: Mutex::new(HashMap::new()),
        }
    }

    /// Reload member and channel lists from the platform. On failure the
    /// previous tables are kept and `false` is returned.
    pub async fn refresh(&self) -> bool {
        let Some(gateway) = &self.gateway else {
            return false;
        };

        let members = match gateway.list_members().await {
            Ok(members) => members,
            Err(e) => {
                warn!("Failed to list members: {:#}", e);
                return false;
            }
        };

        let mut channels = match gateway.list_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!("Failed to list channels: {:#}", e);
                return false;
            }
        };
        match gateway.list_groups().await {
            Ok(groups) => channels.extend(groups),
            Err(e) => warn!("Failed to list private channels: {:#}", e),
        }

        let mut member_index = Index::default();
        for member in members.into_iter().filter_map(Member::from_raw) {
            let (id, name) = (member.id.clone(), member.display_name.clone());
            member_index.insert(&id, &name, Arc::new(member));
        }

        let mut channel_index = Index::default();
        for channel in channels.into_iter().filter_map(Channel::from_raw) {
            let (id, name) = (channel.id.clone(), channel.name.clone());
            channel_index.insert(&id, &name, Arc::new(channel));
        }

        info!(
            "Directory loaded: {} member(s), {} channel(s)",
            member_index.by_id.len(),
            channel_index.by_id.len()
        );
        *self.members.write().await = member_index;
        *self.channels.write().await = channel_index;
        true
    }

    fn user_for(&self, member_id: &str) -> Option<Arc<User>> {
        self.users.iter().find(|u| u.id == member_id).cloned()
    }

    pub async fn resolve_member_by_id(&self, id: &str) -> Option<(Arc<Member>, Option<Arc<User>>)> {
        let member = self.members.read().await.by_id.get(id).cloned()?;
        let user = self.user_for(&member.id);
        Some((member, user))
    }

    pub async fn resolve_member_by_name(
        &self,
        name: &str,
    ) -> Option<(Arc<Member>, Option<Arc<User>>)> {
        let member = self.members.read().await.by_name.get(name).cloned()?;
        let user = self.user_for(&member.id);
        Some((member, user))
    }

    pub async fn list_channels(&self) -> Vec<Arc<Channel>> {
        let channels = self.channels.read().await;
        let mut list: Vec<_> = channels.by_id.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn channel_by_id(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.by_id.get(id).cloned()
    }

    pub async fn channel_by_name(&self, name: &str) -> Option<Arc<Channel>> {
        let name = name.trim_start_matches('#');
        self.channels.read().await.by_name.get(name).cloned()
    }

    /// Id first, then name
    async fn channel_by_key(&self, key: &str) -> Option<Arc<Channel>> {
        match self.channel_by_id(key).await {
            Some(channel) => Some(channel),
            None => self.channel_by_name(key).await,
        }
    }

    /// Detailed channel metadata, fetched on first access and cached. The
    /// table lock is held across the fetch so concurrent callers share it.
    pub async fn channel_info(&self, id_or_name: &str, force: bool) -> Option<Arc<Value>> {
        let gateway = self.gateway.as_ref()?;
        let channel = self.channel_by_key(id_or_name).await?;

        let mut table = self.channel_info.lock().await;
        if !force {
            if let Some(info) = table.get(&channel.id) {
                return Some(Arc::clone(info));
            }
        }

        match gateway.channel_info(&channel.id).await {
            Ok(info) => {
                debug!("Fetched info of channel {}", channel.id);
                let info = Arc::new(info);
                table.insert(channel.id.clone(), Arc::clone(&info));
                Some(info)
            }
            Err(e) => {
                warn!("Failed to get info of channel {}: {:#}", channel.id, e);
                None
            }
        }
    }

    /// Channel history, refetched when forced or older than the refresh
    /// timeout.
    pub async fn channel_history(
        &self,
        name: &str,
        force: bool,
        params: &[(String, String)],
    ) -> Option<Arc<Value>> {
        let gateway = self.gateway.as_ref()?;
        let channel = self.channel_by_key(name).await?;

        let mut table = self.channel_history.lock().await;
        if !force {
            if let Some(entry) = table.get(&channel.id) {
                if entry.refreshed_at.elapsed() <= self.history_refresh_timeout {
                    return Some(Arc::clone(&entry.history));
                }
            }
        }

        match gateway.channel_history(&channel.id, params).await {
            Ok(history) => {
                debug!("Fetched history of channel {}", channel.id);
                let history = Arc::new(history);
                table.insert(
                    channel.id.clone(),
                    ChannelHistoryEntry {
                        history: Arc::clone(&history),
                        refreshed_at: Instant::now(),
                    },
                );
                Some(history)
            }
            Err(e) => {
                warn!("Failed to get history of channel {}: {:#}", channel.id, e);
                None
            }
        }
    }
}
