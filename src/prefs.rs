use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

/// Per-name JSON documents in a directory. Each save overwrites the whole
/// document and is durable once it returns `Ok`.
#[derive(Debug, Clone)]
pub struct PreferencesStore {
    directory: PathBuf,
}

impl PreferencesStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.json", name))
    }

    /// `None` when the document does not exist or cannot be parsed.
    pub fn load(&self, name: &str) -> Option<Value> {
        let path = self.file_for(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read preferences {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt preferences {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, name: &str, data: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.directory).with_context(|| {
            format!(
                "Failed to create preferences directory: {}",
                self.directory.display()
            )
        })?;

        let path = self.file_for(name);
        let tmp = self.directory.join(format!(".{}.json.tmp", name));
        let content = serde_json::to_string_pretty(data)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write preferences: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace preferences: {}", path.display()))?;
        Ok(())
    }
}
