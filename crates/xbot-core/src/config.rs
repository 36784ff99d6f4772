use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration, injected into the managers at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Fallback log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Chat platform credentials
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

/// Alert webhook (Feishu/Lark bot)
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub lark_key: Option<String>,
    #[serde(default = "default_webhook_url_base")]
    pub url_base: String,
    /// Push a one-line summary after each run that delivered or failed something
    #[serde(default)]
    pub push_summary: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,
    #[serde(default = "default_shard_prefix")]
    pub shard_prefix: String,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    pub users_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_download_attempts")]
    pub max_download_attempts: u32,
    #[serde(default = "default_max_entries_per_shard")]
    pub max_entries_per_shard: usize,
    #[serde(default = "default_max_group_items")]
    pub max_group_items: usize,
    #[serde(default = "default_image_max_bytes")]
    pub image_max_bytes: u64,
    #[serde(default = "default_video_max_bytes")]
    pub video_max_bytes: u64,
    #[serde(default = "default_video_max_bytes")]
    pub group_max_bytes: u64,
    #[serde(default = "default_caption_max_chars")]
    pub caption_max_chars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_alert_timeout_secs")]
    pub alert_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Pretty-print shards and output records
    #[serde(default = "default_true")]
    pub pretty: bool,
}

/// Credentials the delivery side cannot run without.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub bot_token: String,
    pub chat_id: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_webhook_url_base() -> String {
    "https://open.feishu.cn/open-apis/bot/v2/hook/".to_string()
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("../dataBase/")
}

fn default_shard_prefix() -> String {
    crate::ledger::SHARD_PREFIX.to_string()
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("../downloads/")
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("../../TypeScript/tweets/")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("../output/")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("../logs/")
}

fn default_max_download_attempts() -> u32 {
    10
}

fn default_max_entries_per_shard() -> usize {
    crate::ledger::MAX_ENTRIES_PER_SHARD
}

fn default_max_group_items() -> usize {
    10
}

fn default_image_max_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_video_max_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_caption_max_chars() -> usize {
    1024
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_alert_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            paths: PathsConfig::default(),
            limits: LimitsConfig::default(),
            http: HttpConfig::default(),
            ledger: LedgerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api_base(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            lark_key: None,
            url_base: default_webhook_url_base(),
            push_summary: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger_dir: default_ledger_dir(),
            shard_prefix: default_shard_prefix(),
            media_dir: default_media_dir(),
            capture_dir: default_capture_dir(),
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            users_file: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_download_attempts: default_max_download_attempts(),
            max_entries_per_shard: default_max_entries_per_shard(),
            max_group_items: default_max_group_items(),
            image_max_bytes: default_image_max_bytes(),
            video_max_bytes: default_video_max_bytes(),
            group_max_bytes: default_video_max_bytes(),
            caption_max_chars: default_caption_max_chars(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            alert_timeout_secs: default_alert_timeout_secs(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { pretty: true }
    }
}

impl Config {
    /// Load configuration from config files and the environment.
    ///
    /// Sources, lowest priority first: `config/xbot.*`, `extra_file`,
    /// `XBOT__SECTION__KEY` variables, then the legacy `BOT_TOKEN`,
    /// `CHAT_ID` and `LARK_KEY` variables.
    pub fn load(extra_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/xbot").required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            // XBOT__TELEGRAM__CHAT_ID -> telegram.chat_id
            .add_source(
                config::Environment::with_prefix("XBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("telegram.bot_token", std::env::var("BOT_TOKEN").ok())?
            .set_override_option("telegram.chat_id", std::env::var("CHAT_ID").ok())?
            .set_override_option("webhook.lark_key", std::env::var("LARK_KEY").ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate_limits()?;
        Ok(config)
    }

    /// Credentials for the chat platform; missing ones are fatal at startup.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let bot_token = non_blank(&self.telegram.bot_token)
            .ok_or(ConfigError::MissingCredential("telegram.bot_token"))?;
        let chat_id = non_blank(&self.telegram.chat_id)
            .ok_or(ConfigError::MissingCredential("telegram.chat_id"))?;
        Ok(Credentials { bot_token, chat_id })
    }

    pub fn validate_limits(&self) -> Result<(), ConfigError> {
        let l = &self.limits;
        if l.max_download_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "limits.max_download_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if l.max_entries_per_shard == 0 {
            return Err(ConfigError::Invalid {
                key: "limits.max_entries_per_shard",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(2..=10).contains(&l.max_group_items) {
            return Err(ConfigError::Invalid {
                key: "limits.max_group_items",
                reason: "must be between 2 and 10".to_string(),
            });
        }
        if l.caption_max_chars < 16 {
            return Err(ConfigError::Invalid {
                key: "limits.caption_max_chars",
                reason: "must be at least 16".to_string(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_secs(self.http.alert_timeout_secs)
    }

    /// Full webhook URL when a key is configured.
    pub fn webhook_url(&self) -> Option<String> {
        non_blank(&self.webhook.lark_key).map(|key| format!("{}{}", self.webhook.url_base, key))
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
