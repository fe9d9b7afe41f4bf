use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::api::models::{Identity, User};
use crate::error::{ChatError, Result};
use crate::sync::transport::TransportKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub user: Option<User>,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub typing: TypingSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub transports: Vec<TransportKind>,
    pub reconnection_attempts: u32,
    pub reconnection_delay_ms: u64,
    pub timeout_ms: u64,
    pub outbox_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            reconnection_attempts: 10,
            reconnection_delay_ms: 1000,
            timeout_ms: 10_000,
            outbox_capacity: 64,
        }
    }
}

impl ConnectionSettings {
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TypingSettings {
    pub quiet_interval_ms: u64,
    /// How long a remote typing indicator survives without a stop signal.
    /// Falls back to the quiet interval.
    pub remote_timeout_ms: Option<u64>,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            quiet_interval_ms: 3000,
            remote_timeout_ms: None,
        }
    }
}

impl TypingSettings {
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms.unwrap_or(self.quiet_interval_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationSettings {
    pub capacity: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("chat-sync.toml"))
    }

    /// Load from the user's config dir. A missing or broken file yields defaults.
    pub fn load() -> Self {
        let Some(path) = Self::toml_path() else {
            log::warn!("no config directory available; using defaults");
            return Self::new();
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(ChatError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::new(),
            Err(e) => {
                log::warn!("ignoring unreadable config {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::toml_path().ok_or_else(|| ChatError::Config("no config dir".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, toml)?;
        Ok(())
    }

    /// The identity handed to the session, if the config carries one.
    pub fn identity(&self) -> Result<Identity> {
        let user = self
            .user
            .clone()
            .ok_or_else(|| ChatError::Config("no user configured".into()))?;
        let token = self
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChatError::Config("no token configured".into()))?;
        Ok(Identity { user, token })
    }
}
