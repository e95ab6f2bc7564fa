//! Configuration loader and validator for the auto-posting bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub schedule: Schedule,
    pub settings: Settings,
    /// Ordered destination list; order defines round-robin rotation.
    pub destinations: Vec<Destination>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub content_dir: String,
    pub state_file: String,
}

/// Telegram bot settings and the two-tier role lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub admin_ids: Vec<i64>,
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

/// Posting cadence and the daily active window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub post_interval_minutes: u64,
    #[serde(default)]
    pub first_post_hour: u32,
    #[serde(default = "default_last_hour")]
    pub last_post_hour: u32,
}

fn default_last_hour() -> u32 {
    24
}

/// Thresholds and tunables for the content pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_low_content_threshold")]
    pub low_content_threshold: usize,
    /// Debounce window for album aggregation, in seconds.
    #[serde(default = "default_quiet_seconds")]
    pub album_quiet_seconds: u64,
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
}

fn default_low_content_threshold() -> usize {
    10
}

fn default_quiet_seconds() -> u64 {
    2
}

fn default_supported_formats() -> Vec<String> {
    [".jpg", ".jpeg", ".png", ".gif", ".webp", ".mp4", ".webm", ".mov"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// One outbound channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
    pub name: String,
    pub chat_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub categories: Vec<Category>,
}

fn default_enabled() -> bool {
    true
}

/// A sub-grouping of assets within a destination, matched by hashtag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub folder: String,
    pub hashtags: Vec<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.content_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.content_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.content_dir)
    }

    pub fn enabled_destinations(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter().filter(|d| d.enabled)
    }

    pub fn destination(&self, id: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.id == id)
    }

    /// Resolve a `#hashtag` to its owning destination and category
    /// (case-insensitive, first match in destination order wins).
    pub fn find_category_by_hashtag(&self, hashtag: &str) -> Option<(&Destination, &Category)> {
        let wanted = hashtag.to_lowercase();
        for dest in &self.destinations {
            for cat in &dest.categories {
                if cat.hashtags.iter().any(|t| t.to_lowercase() == wanted) {
                    return Some((dest, cat));
                }
            }
        }
        None
    }

    /// Whether a file name carries one of the supported media extensions.
    pub fn is_supported_format(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.settings
            .supported_formats
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.content_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.content_dir must be non-empty"));
    }
    if cfg.app.state_file.trim().is_empty() {
        return Err(ConfigError::Invalid("app.state_file must be non-empty"));
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.schedule.post_interval_minutes == 0 {
        return Err(ConfigError::Invalid(
            "schedule.post_interval_minutes must be > 0",
        ));
    }
    if cfg.schedule.last_post_hour > 24 {
        return Err(ConfigError::Invalid("schedule.last_post_hour must be <= 24"));
    }
    if cfg.schedule.first_post_hour >= cfg.schedule.last_post_hour {
        return Err(ConfigError::Invalid(
            "schedule.first_post_hour must be before last_post_hour",
        ));
    }
    if cfg.settings.album_quiet_seconds == 0 {
        return Err(ConfigError::Invalid(
            "settings.album_quiet_seconds must be > 0",
        ));
    }
    if cfg.destinations.is_empty() {
        return Err(ConfigError::Invalid("destinations must be non-empty"));
    }
    for dest in &cfg.destinations {
        if dest.id.trim().is_empty() {
            return Err(ConfigError::Invalid("destinations[].id must be non-empty"));
        }
        if dest.chat_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "destinations[].chat_id must be non-empty",
            ));
        }
        for cat in &dest.categories {
            if cat.folder.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "destinations[].categories[].folder must be non-empty",
                ));
            }
        }
    }
    let mut ids: Vec<&str> = cfg.destinations.iter().map(|d| d.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != cfg.destinations.len() {
        return Err(ConfigError::Invalid("destinations[].id must be unique"));
    }
    Ok(())
}

/// Immutable configuration snapshot behind one shared handle. Reload swaps
/// the whole snapshot; readers always observe either the old or the new one.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn swap(&self, cfg: Config) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(cfg);
    }
}

/// Example YAML configuration, kept in sync with the schema above.
pub fn example() -> &'static str {
    r##"app:
  content_dir: "./content"
  state_file: "./posting_state.json"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  admin_ids:
    - 123456789
  user_ids:
    - 987654321

schedule:
  post_interval_minutes: 30
  first_post_hour: 0
  last_post_hour: 24

settings:
  low_content_threshold: 10
  album_quiet_seconds: 2

destinations:
  - id: "nature"
    name: "Nature Daily"
    chat_id: "-1001111111111"
    enabled: true
    categories:
      - folder: "Forest"
        hashtags: ["#forest", "#woods"]
      - folder: "Sea"
        hashtags: ["#sea"]
  - id: "city"
    name: "City Lights"
    chat_id: "-1002222222222"
    enabled: true
    categories:
      - folder: "Night"
        hashtags: ["#night"]
"##
}
