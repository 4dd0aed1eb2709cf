//! Engine configuration
//!
//! All options can be loaded from a JSON file. Every field has a default, so
//! a config file only needs the values that differ.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, Result};

pub const DEFAULT_NOTIFICATION_URL: &str = "https://notification.adblockplus.org/notification.json";

/// Main configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Subscription records and engine state live here
    pub data_dir: PathBuf,

    /// Aggregate files are written here
    pub cache_dir: PathBuf,

    /// Interval between two periodic update checks
    pub update_check_interval_ms: u64,

    /// Delay before the first periodic check; doubled at most by jitter
    pub initial_check_delay_ms: u64,

    /// Quiet period after the last mutation before the aggregate is rebuilt
    pub rebuild_debounce_ms: u64,

    /// How long the coordinator waits for an event before doing periodic work
    pub event_poll_ms: u64,

    /// Download-only notification channel
    pub notification_url: String,

    /// Device language, selects the default catalog list on first run
    pub language: String,

    /// Which networks may be used for automatic updates
    pub update_policy: UpdatePolicy,

    /// Metered override during the first update pass after bootstrap
    pub first_run_metered: FirstRunMetered,

    /// Catalog JSON replacing the bundled one
    pub catalog_path: Option<PathBuf>,

    /// Bundled text seeding the user filters on first run
    pub user_filters_path: Option<PathBuf>,

    /// Bundled text seeding the user exceptions on first run
    pub user_exceptions_path: Option<PathBuf>,

    /// Bundled copy of the default list, used until its first download
    pub default_list_path: Option<PathBuf>,

    /// HTTP configuration
    pub http: HttpConfig,

    /// Downloader worker configuration
    pub downloader: DownloaderConfig,

    /// Identification sent with every list download
    pub app: AppInfo,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Whole request timeout in seconds
    pub read_timeout: u64,

    pub user_agent: String,

    /// Attempts per download job before it is dropped
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    pub max_retry_delay_ms: u64,
}

/// Downloader worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Longest wait for a job before housekeeping runs
    pub poll_timeout_ms: u64,

    /// Sleep after the connectivity policy refused a job
    pub pause_ms: u64,
}

/// Identification appended to download urls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    pub addon_name: String,
    pub addon_version: String,
    pub application: String,
    pub application_version: String,
    pub platform: String,
    pub platform_version: String,
}

/// Network policy for automatic updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Only unmetered networks
    #[default]
    WifiOnly,
    /// Any connected network
    Always,
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WifiOnly => write!(f, "wifi_only"),
            Self::Always => write!(f, "always"),
        }
    }
}

impl std::str::FromStr for UpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wifi_only" | "wifi-only" | "wifi" => Ok(Self::WifiOnly),
            "always" => Ok(Self::Always),
            _ => Err(format!("Invalid update policy: {}", s)),
        }
    }
}

/// Which downloads of the first update pass may use a metered network
/// regardless of the update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirstRunMetered {
    /// The update policy applies from the start
    Off,
    /// Only the list chosen for the device language
    #[default]
    DefaultListOnly,
    /// Every subscription of the first pass
    AllSubscriptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_dir: PathBuf::from("cache"),
            update_check_interval_ms: 30 * 60 * 1000,
            initial_check_delay_ms: 5_000,
            rebuild_debounce_ms: 2_500,
            event_poll_ms: 100,
            notification_url: DEFAULT_NOTIFICATION_URL.to_string(),
            language: "en".to_string(),
            update_policy: UpdatePolicy::default(),
            first_run_metered: FirstRunMetered::default(),
            catalog_path: None,
            user_filters_path: None,
            user_exceptions_path: None,
            default_list_path: None,
            http: HttpConfig::default(),
            downloader: DownloaderConfig::default(),
            app: AppInfo::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            user_agent: format!("listkeeper/{}", env!("CARGO_PKG_VERSION")),
            max_attempts: 5,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
        }
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 5 * 60 * 1000,
            pause_ms: 30_000,
        }
    }
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            addon_name: "listkeeper".to_string(),
            addon_version: env!("CARGO_PKG_VERSION").to_string(),
            application: "host".to_string(),
            application_version: "0".to_string(),
            platform: std::env::consts::OS.to_string(),
            platform_version: "0".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.user_agent.trim().is_empty() {
            return Err(EngineError::invalid_input("http.user_agent", "Must not be empty"));
        }

        if self.http.max_attempts == 0 {
            return Err(EngineError::invalid_input("http.max_attempts", "Must be at least 1"));
        }

        for (field, value) in [
            ("update_check_interval_ms", self.update_check_interval_ms),
            ("event_poll_ms", self.event_poll_ms),
            ("downloader.poll_timeout_ms", self.downloader.poll_timeout_ms),
            ("downloader.pause_ms", self.downloader.pause_ms),
        ] {
            if value == 0 {
                return Err(EngineError::invalid_input(field, "Must be greater than zero"));
            }
        }

        if self.http.retry_delay_ms > self.http.max_retry_delay_ms {
            return Err(EngineError::invalid_input(
                "http.retry_delay_ms",
                "Must not exceed http.max_retry_delay_ms",
            ));
        }

        Url::parse(&self.notification_url)
            .map_err(|e| EngineError::invalid_input("notification_url", e.to_string()))?;

        Ok(())
    }

    pub fn subscriptions_dir(&self) -> PathBuf {
        self.data_dir.join("subscriptions")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("engine_state.json")
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_millis(self.update_check_interval_ms)
    }

    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}
