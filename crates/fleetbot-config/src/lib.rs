//! Fleetbot Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub bot_token: String,
    /// Token with `users:read.email`, used only for identity lookups.
    #[serde(default)]
    pub user_token: String,
    pub signing_secret: Option<String>,
    /// Stripped from the caller's e-mail to get the backend account name.
    #[serde(default)]
    pub company_domain: String,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: default_chat_api_url(),
            bot_token: String::new(),
            user_token: String::new(),
            signing_secret: None,
            company_domain: String::new(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_events_path")]
    pub events_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            events_path: default_events_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Names containing this character are synthetic records and are skipped
    /// by fleet-wide commands. Empty string disables the filter.
    #[serde(default = "default_reserved_name_char")]
    pub reserved_name_char: String,
    #[serde(default = "default_excluded_apps")]
    pub excluded_apps: Vec<String>,
    #[serde(default = "default_checkin_days")]
    pub checkin_days: i64,
    #[serde(default = "default_reboot_days")]
    pub reboot_days: i64,
    #[serde(default = "default_startup_attribute_id")]
    pub startup_attribute_id: String,
    #[serde(default = "default_appstore_top")]
    pub appstore_top: usize,
    #[serde(default = "default_chart_top_apps")]
    pub chart_top_apps: usize,
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default)]
    pub denied_channels: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reserved_name_char: default_reserved_name_char(),
            excluded_apps: default_excluded_apps(),
            checkin_days: default_checkin_days(),
            reboot_days: default_reboot_days(),
            startup_attribute_id: default_startup_attribute_id(),
            appstore_top: default_appstore_top(),
            chart_top_apps: default_chart_top_apps(),
            allowed_channels: Vec::new(),
            denied_channels: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn reserved_char(&self) -> Option<char> {
        self.reserved_name_char.chars().next()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_chat_api_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_max_message_chars() -> usize {
    4000
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_events_path() -> String {
    "/slack/events".to_string()
}

fn default_concurrency() -> usize {
    16
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_reserved_name_char() -> String {
    "_".to_string()
}

fn default_excluded_apps() -> Vec<String> {
    ["Pages.app", "GarageBand.app", "iMovie.app", "Keynote.app", "Numbers.app"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_checkin_days() -> i64 {
    40
}

fn default_reboot_days() -> i64 {
    60
}

fn default_startup_attribute_id() -> String {
    "29".to_string()
}

fn default_appstore_top() -> usize {
    15
}

fn default_chart_top_apps() -> usize {
    12
}

fn default_dedup_window_secs() -> u64 {
    600
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fleetbot").join("config.toml"))
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay secrets and endpoints from the environment. Empty values are
    /// ignored so an exported-but-blank variable never wipes a file setting.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("JAMF_URL") {
            self.backend.base_url = value;
        }
        if let Some(value) = get("JAMF_CLIENT_ID") {
            self.backend.client_id = value;
        }
        if let Some(value) = get("JAMF_CLIENT_SECRET") {
            self.backend.client_secret = value;
        }
        if let Some(value) = get("SLACK_BOT_TOKEN") {
            self.chat.bot_token = value;
        }
        if let Some(value) = get("SLACK_USER_TOKEN") {
            self.chat.user_token = value;
        }
        if let Some(value) = get("SLACK_SIGNING_SECRET") {
            self.chat.signing_secret = Some(value);
        }
        if let Some(value) = get("COMPANY_DOMAIN") {
            self.chat.company_domain = value;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let base_url = self.backend.base_url.trim();
        if base_url.is_empty() {
            anyhow::bail!("backend.base_url cannot be empty");
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("backend.base_url must be an http(s) URL, got '{}'", base_url);
        }
        if self.backend.request_timeout_secs == 0 {
            anyhow::bail!("backend.request_timeout_secs must be > 0");
        }

        if self.fanout.concurrency == 0 {
            anyhow::bail!("fanout.concurrency must be > 0");
        }
        if self.fanout.task_timeout_secs == 0 {
            anyhow::bail!("fanout.task_timeout_secs must be > 0");
        }

        if self.dedup.window_secs == 0 {
            anyhow::bail!("dedup.window_secs must be > 0");
        }

        if self.chat.max_message_chars < 256 {
            anyhow::bail!(
                "chat.max_message_chars must be >= 256, got {}",
                self.chat.max_message_chars
            );
        }
        if !self.server.events_path.starts_with('/') {
            anyhow::bail!(
                "server.events_path must start with '/', got '{}'",
                self.server.events_path
            );
        }

        if self.policy.reserved_name_char.chars().count() > 1 {
            anyhow::bail!(
                "policy.reserved_name_char must be a single character, got '{}'",
                self.policy.reserved_name_char
            );
        }
        if self.policy.checkin_days <= 0 {
            anyhow::bail!("policy.checkin_days must be > 0");
        }
        if self.policy.reboot_days <= 0 {
            anyhow::bail!("policy.reboot_days must be > 0");
        }
        if self.policy.appstore_top == 0 || self.policy.chart_top_apps == 0 {
            anyhow::bail!("policy.appstore_top and policy.chart_top_apps must be > 0");
        }

        let allowed: HashSet<&str> = self
            .policy
            .allowed_channels
            .iter()
            .map(|c| c.trim())
            .collect();
        for denied in &self.policy.denied_channels {
            if allowed.contains(denied.trim()) {
                anyhow::bail!(
                    "Channel '{}' is both allowed and denied in [policy]",
                    denied.trim()
                );
            }
        }

        Ok(())
    }
}
