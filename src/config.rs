use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::channels::{TelegramConfig, WecomConfig};
use crate::dispatcher::DEFAULT_TTL_SECS;
use crate::forward::SmtpConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    pub telegram: Option<TelegramConfig>,
    pub wecom: Option<WecomConfig>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    /// Comma-separated addresses and domains allowed to trigger notifications.
    #[serde(default)]
    pub allowed_senders: String,
    /// Comma-separated keywords marking an email as carrying a code.
    #[serde(default)]
    pub code_keywords: String,
    /// Mailbox that receives every inbound email.
    #[serde(default)]
    pub forward_to: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret expected in the `X-Relay-Token` header.
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("mailrelay.db")
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_bind() -> String {
    "127.0.0.1:8025".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            database_path: default_db_path(),
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LedgerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load from `path` (optional), apply environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            warn!(
                "Config file {} not found; using defaults and environment",
                path.display()
            );
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from `lookup` (the process environment in production).
    /// Values are trimmed; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("ALLOWED_SENDERS") {
            self.relay.allowed_senders = v;
        }
        if let Some(v) = get("CODE_KEYWORDS") {
            self.relay.code_keywords = v;
        }
        if let Some(v) = get("FORWARD_TO") {
            self.relay.forward_to = v;
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.get_or_insert_with(Default::default).bot_token = v;
        }
        if let Some(v) = get("TELEGRAM_CHAT_IDS") {
            self.telegram.get_or_insert_with(Default::default).chat_ids = v;
        }
        if let Some(v) = get("WECOM_KEYS") {
            self.wecom.get_or_insert_with(Default::default).keys = v;
        }
        if let Some(v) = get("LEDGER_TTL_SECONDS") {
            self.ledger.ttl_seconds = v
                .parse()
                .with_context(|| format!("LEDGER_TTL_SECONDS is not a number: {}", v))?;
        }
        if let Some(v) = get("RELAY_AUTH_TOKEN") {
            self.server.auth_token = Some(v);
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.smtp.password = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.allowed_senders.trim().is_empty() {
            bail!("relay.allowed_senders (ALLOWED_SENDERS) must not be empty");
        }
        if self.relay.code_keywords.trim().is_empty() {
            bail!("relay.code_keywords (CODE_KEYWORDS) must not be empty");
        }
        if self.relay.forward_to.trim().is_empty() {
            bail!("relay.forward_to (FORWARD_TO) must not be empty");
        }
        if self.ledger.ttl_seconds == 0 {
            bail!("ledger.ttl_seconds must be greater than zero");
        }
        if self.telegram.is_none() && self.wecom.is_none() {
            info!("Neither [telegram] nor [wecom] configured");
        }
        Ok(())
    }

    /// Configured auth token, treating an empty string as unset.
    pub fn auth_token(&self) -> Option<String> {
        self.server
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}
