//! Saved session and tuning knobs.
//!
//! The auth token and the signed-in user are the only client state that
//! outlives a run. Everything else is rebuilt from the server.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::models::UserProfile;
use crate::error::SyncError;
use crate::utils::{normalize_url, socket_url};

const CONFIG_FILE: &str = "admin-sync.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub ack_timeout_ms: u64,
    pub typing_idle_ms: u64,
    pub notification_ttl_ms: u64,
    pub refresh_interval_secs: u64,
    /// Refetch an order after a realtime ack instead of trusting the ack.
    pub refetch_after_realtime: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            typing_idle_ms: 2_000,
            notification_ttl_ms: 10_000,
            refresh_interval_secs: 30,
            refetch_after_realtime: true,
        }
    }
}

impl SyncSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppState {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    pub sync: SyncSettings,
}

impl AppState {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_url(base_url),
            ..Self::default()
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join(CONFIG_FILE))
    }

    /// Reads the saved state; a missing file is an empty state.
    pub fn load() -> Result<Self, SyncError> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SyncError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(SyncError::Config(format!("{}: {}", path.display(), e))),
        };
        toml::from_str(&text).map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self) -> Result<(), SyncError> {
        let path = Self::config_path()
            .ok_or_else(|| SyncError::Config("no config directory".to_string()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SyncError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        fs::write(path, text).map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn sign_in(&mut self, token: &str, user: UserProfile) {
        self.token = Some(token.to_string());
        self.user = Some(user);
    }

    pub fn sign_out(&mut self) {
        self.token = None;
        self.user = None;
    }

    pub fn has_session(&self) -> bool {
        !self.base_url.is_empty() && self.token.is_some() && self.user.is_some()
    }

    pub fn realtime_url(&self) -> Result<Url, SyncError> {
        match &self.socket_url {
            Some(url) => Url::parse(url)
                .map_err(|e| SyncError::Config(format!("invalid socket url {:?}: {}", url, e))),
            None => socket_url(&self.base_url),
        }
    }
}
