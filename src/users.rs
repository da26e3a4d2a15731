use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Boss,
    NormalUser,
    BadUser,
}

/// A person the bot knows about from local configuration, as opposed to a
/// platform [`Member`](crate::directory::Member).
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub user_type: UserType,
    pub names: Vec<String>,
    pub location: Option<String>,
}

#[derive(Deserialize)]
struct UserEntry {
    id: String,
    #[serde(rename = "type")]
    user_type: Option<String>,
    names: Vec<String>,
    location: Option<String>,
}

impl User {
    /// Parse one entry; `None` when it lacks an id or names, or names an
    /// unknown user type.
    fn from_entry(value: &Value) -> Option<Self> {
        let entry: UserEntry = serde_json::from_value(value.clone()).ok()?;
        let user_type = match entry.user_type {
            None => UserType::NormalUser,
            Some(t) => serde_json::from_value(Value::String(t.to_lowercase())).ok()?,
        };
        Some(Self {
            id: entry.id,
            user_type,
            names: entry.names,
            location: entry.location,
        })
    }

    pub fn is_boss(&self) -> bool {
        self.user_type == UserType::Boss
    }
}

/// Parse a JSON array of user entries, skipping invalid ones.
pub fn parse_user_list(content: &str) -> Result<Vec<User>> {
    let data: Value = serde_json::from_str(content).context("User list is not valid JSON")?;
    let entries = data.as_array().context("User list must be a JSON array")?;
    Ok(entries.iter().filter_map(User::from_entry).collect())
}

/// Load the user list; a missing or unreadable file yields an empty list.
pub fn load_user_list(path: Option<&Path>) -> Vec<User> {
    let Some(path) = path else {
        return Vec::new();
    };
    let loaded = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read user list: {}", path.display()))
        .and_then(|content| parse_user_list(&content));
    match loaded {
        Ok(users) => {
            info!("Loaded {} user(s) from {}", users.len(), path.display());
            users
        }
        Err(e) => {
            warn!("{:#}", e);
            Vec::new()
        }
    }
}
