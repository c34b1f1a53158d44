//! Telegram Bot API channel.
//!
//! Posts to `/bot<token>/sendMessage` once per configured chat id, using
//! MarkdownV2 formatting.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use super::{
    close_open_fence, deliver_all, parse_destinations, DeliveryOutcome, Destination,
    NotificationChannel,
};
use crate::error::ChannelError;
use crate::http::HttpTransport;
use crate::message::{header_fields, NormalizedMessage};

const CHANNEL: &str = "telegram";

/// Telegram `sendMessage` text limit (characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const TRUNCATED_SUFFIX: &str = "\n\n\\[truncated\\]";

/// Characters MarkdownV2 reserves; each must be preceded by a backslash.
const RESERVED: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

static CHAT_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+$").unwrap());
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Comma-separated chat ids (users, groups or channels).
    #[serde(default)]
    pub chat_ids: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_ids: String::new(),
            api_base: default_api_base(),
        }
    }
}

pub struct TelegramChannel {
    destinations: Vec<Destination>,
    transport: Arc<dyn HttpTransport>,
}

impl TelegramChannel {
    pub fn new(
        config: &TelegramConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ChannelError> {
        let token = config.bot_token.trim();
        if token.is_empty() {
            return Err(ChannelError::config(CHANNEL, "bot token is not configured"));
        }

        let endpoint = format!(
            "{}/bot{}/sendMessage",
            config.api_base.trim_end_matches('/'),
            token
        );
        let destinations = parse_destinations(CHANNEL, &config.chat_ids, |t| CHAT_ID.is_match(t))?
            .into_iter()
            .map(|id| Destination {
                id,
                endpoint: endpoint.clone(),
            })
            .collect();

        Ok(Self {
            destinations,
            transport,
        })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        CHANNEL
    }

    fn destinations(&self) -> usize {
        self.destinations.len()
    }

    async fn send(&self, message: &NormalizedMessage) -> Vec<DeliveryOutcome> {
        let text = format_message(message);

        deliver_all(
            CHANNEL,
            self.transport.as_ref(),
            &self.destinations,
            |dest| {
                json!({
                    "chat_id": dest.id,
                    "text": text,
                    "parse_mode": "MarkdownV2",
                })
            },
            |_| Ok(()),
        )
        .await
    }
}

/// Escape every MarkdownV2 reserved character with a backslash.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if RESERVED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Collapse runs of blank lines into a single blank line.
pub fn collapse_blank_lines(text: &str) -> String {
    BLANK_LINES.replace_all(text, "\n\n").into_owned()
}

pub fn format_message(message: &NormalizedMessage) -> String {
    let mut text = String::new();
    for (label, value) in header_fields(message) {
        text.push_str(&format!("*{}:* {}\n", label, escape_markdown_v2(&value)));
    }
    text.push('\n');
    text.push_str(&escape_markdown_v2(&message.body_markdown));

    truncate_message(&collapse_blank_lines(&text), TELEGRAM_MESSAGE_LIMIT)
}

/// Truncate to `limit` characters without leaving a dangling escape backslash
/// or an open code fence.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let budget = limit - TRUNCATED_SUFFIX.chars().count();
    let taken: String = text.chars().take(budget).collect();
    let mut truncated = close_open_fence(&taken).to_string();

    let trailing = truncated.chars().rev().take_while(|c| *c == '\\').count();
    if trailing % 2 == 1 {
        truncated.pop();
    }
    format!("{}{}", truncated, TRUNCATED_SUFFIX)
}
