//! Notification channels.
//!
//! Each channel formats a `NormalizedMessage` for one provider and delivers it
//! to every configured destination of that provider:
//! - Telegram Bot API (`sendMessage`, MarkdownV2)
//! - WeCom group robot webhooks

mod telegram;
mod wecom;

pub use telegram::{TelegramChannel, TelegramConfig};
pub use wecom::{WecomChannel, WecomConfig, WecomMsgType};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, DeliveryError};
use crate::http::HttpTransport;
use crate::message::NormalizedMessage;

/// One settled delivery attempt to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub channel: &'static str,
    pub destination: String,
    pub result: Result<(), DeliveryError>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// A configured destination: its identifier and the endpoint derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
    pub endpoint: String,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Provider name, used in outcomes and logs.
    fn name(&self) -> &'static str;

    /// Number of configured destinations (never zero).
    fn destinations(&self) -> usize;

    /// Deliver to every destination concurrently. Returns one outcome per
    /// destination, in destination order. Never fails as a whole.
    async fn send(&self, message: &NormalizedMessage) -> Vec<DeliveryOutcome>;
}

/// Split a comma-separated destination list, keeping distinct tokens accepted by `valid`.
///
/// Invalid tokens are dropped with a warning; a repeated token keeps its first
/// position. Fails when nothing survives.
pub fn parse_destinations(
    channel: &'static str,
    raw: &str,
    valid: impl Fn(&str) -> bool,
) -> Result<Vec<String>, ChannelError> {
    let mut ids = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !valid(token) {
            warn!("{}: dropping invalid destination {:?}", channel, token);
        } else if ids.iter().any(|id| id == token) {
            debug!("{}: ignoring duplicate destination {:?}", channel, token);
        } else {
            ids.push(token.to_string());
        }
    }

    if ids.is_empty() {
        return Err(ChannelError::config(channel, "no valid destinations configured"));
    }
    Ok(ids)
}

/// POST the same payload to every destination concurrently and settle each one.
///
/// `payload_for` builds the body for a destination; `check` inspects a 2xx
/// response body for provider-level rejections.
pub async fn deliver_all(
    channel: &'static str,
    transport: &dyn HttpTransport,
    destinations: &[Destination],
    payload_for: impl Fn(&Destination) -> Value + Send + Sync,
    check: impl Fn(&str) -> Result<(), DeliveryError> + Send + Sync,
) -> Vec<DeliveryOutcome> {
    let sends = destinations.iter().map(|dest| {
        let payload = payload_for(dest);
        let check = &check;
        async move {
            let result = match transport.post_json(&dest.endpoint, &payload).await {
                Ok(resp) if resp.is_success() => check(&resp.body),
                Ok(resp) => Err(DeliveryError::Status {
                    status: resp.status,
                    body: resp.body,
                }),
                Err(e) => Err(e.into()),
            };

            match &result {
                Ok(()) => info!("{}: delivered to {}", channel, dest.id),
                Err(e) => error!("{}: delivery to {} failed: {}", channel, dest.id, e),
            }

            DeliveryOutcome {
                channel,
                destination: dest.id.clone(),
                result,
            }
        }
    });

    join_all(sends).await
}

/// Truncate to at most `max_bytes` bytes, walking back to a UTF-8 char boundary.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Code fence emitted around highlighted verification codes.
const FENCE: &str = "```";

/// Cut back to before the last fence when fences are unbalanced, so a truncated
/// text never leaves a code block open.
pub fn close_open_fence(text: &str) -> &str {
    if text.matches(FENCE).count() % 2 == 0 {
        return text;
    }
    match text.rfind(FENCE) {
        Some(pos) => text[..pos].trim_end_matches('`'),
        None => text,
    }
}

/// Build every configured channel. A channel whose configuration is invalid is
/// logged and skipped; an empty result is a valid, logged configuration.
pub fn build_channels(
    telegram: Option<&TelegramConfig>,
    wecom: Option<&WecomConfig>,
    transport: Arc<dyn HttpTransport>,
) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    if let Some(config) = telegram {
        match TelegramChannel::new(config, Arc::clone(&transport)) {
            Ok(channel) => channels.push(Arc::new(channel)),
            Err(e) => error!("Skipping Telegram channel: {}", e),
        }
    }

    if let Some(config) = wecom {
        match WecomChannel::new(config, Arc::clone(&transport)) {
            Ok(channel) => channels.push(Arc::new(channel)),
            Err(e) => error!("Skipping WeCom channel: {}", e),
        }
    }

    if channels.is_empty() {
        warn!("No notification channels configured; emails will only be forwarded");
    } else {
        for channel in &channels {
            info!(
                "Channel '{}' ready with {} destination(s)",
                channel.name(),
                channel.destinations()
            );
        }
    }

    channels
}
