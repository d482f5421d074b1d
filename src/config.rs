use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::diff::DiffMode;
use crate::listing::DEFAULT_SKIP_CARDS;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    default_base_dir().join("listwatch.sqlite")
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:3000".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Substring every task URL must contain.
    #[serde(default = "default_host_marker")]
    pub host_marker: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Leading promoted cards to drop from every page.
    #[serde(default = "default_skip_cards")]
    pub skip_cards: usize,
    #[serde(default = "default_item_limit")]
    pub item_limit: usize,
    #[serde(default = "default_probe_limit")]
    pub probe_limit: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            host_marker: default_host_marker(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            skip_cards: default_skip_cards(),
            item_limit: default_item_limit(),
            probe_limit: default_probe_limit(),
        }
    }
}

fn default_host_marker() -> String {
    "bina.az".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:66.0) Gecko/20100101 Firefox/66.0".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_skip_cards() -> usize {
    DEFAULT_SKIP_CARDS
}

fn default_item_limit() -> usize {
    10
}

fn default_probe_limit() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub diff_mode: DiffMode,
    /// Skip ticks for owners whose subscription has run out.
    #[serde(default = "default_true")]
    pub pause_expired_owners: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            diff_mode: DiffMode::default(),
            pause_expired_owners: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            trial_days: default_trial_days(),
        }
    }
}

fn default_trial_days() -> u32 {
    3
}

#[derive(Debug, Default, Deserialize)]
pub struct NotifyConfig {
    /// JSON notifications are POSTed here; log-only when unset.
    pub webhook_url: Option<String>,
}

pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".listwatch")
}

pub fn load(path: &str) -> Result<Config> {
    let path = expand_tilde(path);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config.toml")?;
    config.storage.db_path = expand_tilde(&config.storage.db_path.to_string_lossy());
    Ok(config)
}

pub async fn init_config_dir() -> Result<PathBuf> {
    let base = default_base_dir();
    tokio::fs::create_dir_all(&base).await?;

    let config_path = base.join("config.toml");
    if !config_path.exists() {
        tokio::fs::write(
            &config_path,
            r#"[storage]
db_path = "~/.listwatch/listwatch.sqlite"

[api]
bind = "127.0.0.1:3000"

[fetcher]
host_marker = "bina.az"
timeout_secs = 20
# Promoted cards at the top of every page; change only if the layout changes.
skip_cards = 4
item_limit = 10
probe_limit = 10

[monitor]
# "stop_at_first_known" or "all_unseen"
diff_mode = "stop_at_first_known"
pause_expired_owners = true

[subscription]
trial_days = 3

# [notify]
# webhook_url = "http://127.0.0.1:8080/listwatch"
"#,
        )
        .await?;
    }

    Ok(config_path)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
