//! Configuration file loading and validation
//!
//! The config is a TOML file. A few values can be overridden from the
//! environment so secrets need not live in the file:
//! `DATABASE_PATH`, `QBITTORRENT_URL`, `QBITTORRENT_USERNAME`,
//! `QBITTORRENT_PASSWORD`.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::models::{Feed, RuleSpec};
use crate::scraper::matcher::Rule;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Also append logs to this file
    #[serde(default)]
    pub log_file: Option<String>,
    /// Dispatch records older than this are pruned; 0 keeps them forever
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
    #[serde(default = "default_feed_timeout_secs")]
    pub feed_timeout_secs: u64,
    pub client: ClientConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub feeds: Vec<Feed>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// Remote qBittorrent WebUI connection
#[derive(Clone, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Assumed session lifetime; the client logs in again once it passes
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Categories left alone by the pause-all control
    #[serde(default)]
    pub pause_excluded_categories: Vec<String>,
    /// Wait between force-reannounce and stop when pausing
    #[serde(default = "default_reannounce_wait_secs")]
    pub reannounce_wait_secs: u64,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("retry", &self.retry)
            .field("pause_excluded_categories", &self.pause_excluded_categories)
            .field("reannounce_wait_secs", &self.reannounce_wait_secs)
            .finish()
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

impl AppConfig {
    /// Read, apply environment overrides, and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("{}", e))
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(url) = lookup("QBITTORRENT_URL") {
            self.client.url = url;
        }
        if let Some(username) = lookup("QBITTORRENT_USERNAME") {
            self.client.username = username;
        }
        if let Some(password) = lookup("QBITTORRENT_PASSWORD") {
            self.client.password = password;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.client.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("client.url must be an http(s) URL, got '{}'", self.client.url);
        }
        if self.client.retry.max_attempts == 0 {
            bail!("client.retry.max_attempts must be at least 1");
        }
        if self.client.request_timeout_secs == 0 || self.feed_timeout_secs == 0 {
            bail!("timeouts must be greater than zero");
        }

        let mut feed_ids = HashSet::new();
        for feed in &self.feeds {
            if feed.id.trim().is_empty() {
                bail!("feed id must not be empty");
            }
            if !feed_ids.insert(feed.id.as_str()) {
                bail!("duplicate feed id '{}'", feed.id);
            }
            if feed.url.trim().is_empty() {
                bail!("feed '{}' has no url", feed.id);
            }
            if feed.interval_secs == 0 {
                bail!("feed '{}' interval_secs must be greater than zero", feed.id);
            }
        }

        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.id.as_str()) {
                bail!("duplicate rule id '{}'", rule.id);
            }
            if !feed_ids.contains(rule.feed.as_str()) {
                bail!("rule '{}' references unknown feed '{}'", rule.id, rule.feed);
            }
            Rule::compile(rule.clone()).with_context(|| format!("rule '{}' is invalid", rule.id))?;
        }

        Ok(())
    }
}

fn default_database_path() -> String {
    "dispatch.db".to_string()
}

fn default_retention_days() -> u32 {
    180
}

fn default_feed_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    45
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_reannounce_wait_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_enabled() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:56578".to_string()
}
