//! # Engine Configuration
//!
//! `SyncConfig` is built from defaults, then `sync.toml` in the platform
//! config directory, then `CINDER_*` environment variables, each layer
//! overriding the one before.
//!
//! ```text
//!  defaults ──► sync.toml ──► CINDER_USER_UUID, CINDER_SERVER_URL, ... ──► validate()
//!               ~/.config/cinder/sync.toml (Linux)
//!               ~/Library/Application Support/com.cinder.cinder/sync.toml (macOS)
//! ```
//!
//! ## File Format
//! ```toml
//! [account]
//! user_uuid = "550e8400-e29b-41d4-a716-446655440000"
//! device_name = "Laptop"
//!
//! [server]
//! url = "wss://sync.example.com/v1"
//! page_limit = 150
//!
//! [sync]
//! interval_secs = 30
//! max_stale_token_replays = 3
//! max_backfill_attempts = 5
//!
//! [storage]
//! database_path = "/var/lib/cinder/cinder.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Account
// =============================================================================

/// Who this engine syncs for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// The signed-in user's uuid. Required.
    #[serde(default)]
    pub user_uuid: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

fn default_device_name() -> String {
    "Cinder Device".to_string()
}

impl Default for AccountConfig {
    fn default() -> Self {
        AccountConfig {
            user_uuid: String::new(),
            device_name: default_device_name(),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Remote endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// WebSocket URL of the sync endpoint.
    #[serde(default)]
    pub url: Option<String>,

    /// WebSocket handshake timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for one request/response round trip (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum items the server returns per page.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_page_limit() -> u32 {
    150
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            url: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            page_limit: default_page_limit(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync cycle and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Set to false to keep the engine local-only.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between background cycles (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// How many times a page is replayed with a fresh token.
    #[serde(default = "default_stale_token_replays")]
    pub max_stale_token_replays: u32,

    /// Cycles an item may wait for a missing key before a warning is raised.
    #[serde(default = "default_backfill_attempts")]
    pub max_backfill_attempts: u32,

    /// Consecutive retries of a failed cycle before waiting for the next
    /// tick. 0 retries without limit.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay (milliseconds). Doubles per attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Cap on the retry delay (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    30
}
fn default_stale_token_replays() -> u32 {
    3
}
fn default_backfill_attempts() -> u32 {
    5
}
fn default_max_retries() -> u32 {
    0
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: true,
            interval_secs: default_interval(),
            max_stale_token_replays: default_stale_token_replays(),
            max_backfill_attempts: default_backfill_attempts(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Local persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// SyncConfig
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a config for `user_uuid` with every other value defaulted.
    pub fn for_user(user_uuid: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.account.user_uuid = user_uuid.into();
        config
    }

    /// Layers the file (if present) and the environment over the defaults,
    /// then validates.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Reading engine config");
                config = toml::from_str(&std::fs::read_to_string(&path)?)?;
            } else {
                debug!(?path, "No config file, starting from defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Like [`SyncConfig::load`], but an unreadable or invalid file yields
    /// the defaults. The result still fails `validate()` without a user uuid.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error = %e, "Engine config unusable, falling back to defaults");
            Self::default()
        })
    }

    /// Writes pretty TOML, creating the parent directory.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("platform has no config directory".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;

        info!(?path, "Engine config written");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.account.user_uuid.trim().is_empty() {
            return Err(SyncError::InvalidConfig("account.user_uuid is required".into()));
        }

        if let Some(ref raw) = self.server.url {
            let url = Url::parse(raw)?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(SyncError::InvalidUrl(format!(
                    "Server URL must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        if self.server.page_limit == 0 {
            return Err(SyncError::InvalidConfig(
                "page_limit must be greater than 0".into(),
            ));
        }

        if self.sync.max_backfill_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_backfill_attempts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(uuid) = std::env::var("CINDER_USER_UUID") {
            debug!(user_uuid = %uuid, "Overriding user uuid from environment");
            self.account.user_uuid = uuid;
        }

        if let Ok(name) = std::env::var("CINDER_DEVICE_NAME") {
            self.account.device_name = name;
        }

        if let Ok(url) = std::env::var("CINDER_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.url = Some(url);
        }

        if let Ok(limit) = std::env::var("CINDER_PAGE_LIMIT") {
            match limit.parse::<u32>() {
                Ok(l) => self.server.page_limit = l,
                Err(_) => warn!(value = %limit, "Ignoring invalid CINDER_PAGE_LIMIT"),
            }
        }

        if let Ok(interval) = std::env::var("CINDER_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.sync.interval_secs = secs;
            }
        }

        if let Ok(path) = std::env::var("CINDER_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "cinder", "cinder")
    }

    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn user_uuid(&self) -> &str {
        &self.account.user_uuid
    }

    pub fn server_url(&self) -> Option<&str> {
        self.server.url.as_deref()
    }

    /// Database file, falling back to the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("cinder.db")))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.account.user_uuid.is_empty());
        assert_eq!(config.server.page_limit, 150);
        assert_eq!(config.sync.max_stale_token_replays, 3);
        assert!(config.sync.enabled);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_err());

        config.account.user_uuid = "alice".into();
        assert!(config.validate().is_ok());

        config.server.url = Some("http://sync.example.com".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.server.url = Some("not a url".into());
        assert!(config.validate().is_err());

        config.server.url = Some("wss://sync.example.com/v1".into());
        assert!(config.validate().is_ok());

        config.server.page_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = SyncConfig::for_user("alice");
        config.server.url = Some("ws://localhost:3000".into());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[account]"));
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[sync]"));

        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.user_uuid(), "alice");
        assert_eq!(parsed.server_url(), Some("ws://localhost:3000"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [account]
            user_uuid = "bob"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.account.device_name, "Cinder Device");
        assert_eq!(parsed.sync.interval_secs, 30);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("cinder-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("sync.toml");

        let config = SyncConfig::for_user("carol");
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.account.user_uuid, "carol");

        let _ = std::fs::remove_dir_all(dir);
    }
}
