//! WeCom (WeChat Work) group robot channel.
//!
//! Each configured key is a robot webhook; the robot replies `200` even on
//! failure, with a non-zero `errcode` in the body.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    close_open_fence, deliver_all, parse_destinations, truncate_bytes, DeliveryOutcome,
    Destination, NotificationChannel,
};
use crate::error::{ChannelError, DeliveryError};
use crate::http::HttpTransport;
use crate::message::{render_markdown, render_plain_text, NormalizedMessage};

const CHANNEL: &str = "wecom";

const MARKDOWN_LIMIT_BYTES: usize = 4096;
const TEXT_LIMIT_BYTES: usize = 2048;

static WEBHOOK_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WecomMsgType {
    Text,
    #[default]
    Markdown,
}

impl WecomMsgType {
    fn as_str(&self) -> &'static str {
        match self {
            WecomMsgType::Text => "text",
            WecomMsgType::Markdown => "markdown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WecomConfig {
    /// Comma-separated robot webhook keys.
    #[serde(default)]
    pub keys: String,
    #[serde(default)]
    pub msgtype: WecomMsgType,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

impl Default for WecomConfig {
    fn default() -> Self {
        Self {
            keys: String::new(),
            msgtype: WecomMsgType::default(),
            api_base: default_api_base(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RobotReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

pub struct WecomChannel {
    msgtype: WecomMsgType,
    destinations: Vec<Destination>,
    transport: Arc<dyn HttpTransport>,
}

impl WecomChannel {
    pub fn new(
        config: &WecomConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ChannelError> {
        let base = config.api_base.trim_end_matches('/');
        let destinations = parse_destinations(CHANNEL, &config.keys, |t| WEBHOOK_KEY.is_match(t))?
            .into_iter()
            .map(|key| Destination {
                endpoint: format!("{}/cgi-bin/webhook/send?key={}", base, key),
                id: key,
            })
            .collect();

        Ok(Self {
            msgtype: config.msgtype,
            destinations,
            transport,
        })
    }

    fn build_payload(&self, message: &NormalizedMessage) -> Value {
        let kind = self.msgtype.as_str();
        let content = match self.msgtype {
            WecomMsgType::Markdown => {
                let rendered = render_markdown(message);
                let cut = truncate_bytes(&rendered, MARKDOWN_LIMIT_BYTES);
                if cut.len() < rendered.len() {
                    close_open_fence(cut).to_string()
                } else {
                    cut.to_string()
                }
            }
            WecomMsgType::Text => {
                truncate_bytes(&render_plain_text(message), TEXT_LIMIT_BYTES).to_string()
            }
        };
        json!({
            "msgtype": kind,
            kind: { "content": content },
        })
    }
}

/// A `200` reply whose JSON carries a non-zero `errcode` is a rejection.
fn check_reply(body: &str) -> Result<(), DeliveryError> {
    match serde_json::from_str::<RobotReply>(body) {
        Ok(reply) if reply.errcode != 0 => Err(DeliveryError::Rejected {
            code: reply.errcode,
            message: reply.errmsg,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl NotificationChannel for WecomChannel {
    fn name(&self) -> &'static str {
        CHANNEL
    }

    fn destinations(&self) -> usize {
        self.destinations.len()
    }

    async fn send(&self, message: &NormalizedMessage) -> Vec<DeliveryOutcome> {
        let payload = self.build_payload(message);

        deliver_all(
            CHANNEL,
            self.transport.as_ref(),
            &self.destinations,
            |_| payload.clone(),
            check_reply,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::FakeTransport;

    const KEY_A: &str = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";
    const KEY_B: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

    fn url(key: &str) -> String {
        format!("https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key={}", key)
    }

    fn message() -> NormalizedMessage {
        NormalizedMessage {
            from: "alice@example.com".to_string(),
            subject: "OTP".to_string(),
            body_text: "code 12345678".to_string(),
            body_markdown: "code ```12345678```".to_string(),
            ..Default::default()
        }
    }

    fn channel(keys: &str, msgtype: WecomMsgType, transport: Arc<FakeTransport>) -> WecomChannel {
        let cfg = WecomConfig {
            keys: keys.to_string(),
            msgtype,
            ..Default::default()
        };
        WecomChannel::new(&cfg, transport).unwrap()
    }

    #[test]
    fn test_key_validation() {
        let raw = format!(
            "{}, not-a-uuid, {}, {}",
            KEY_A, "3f2504e04f8911d39a0c0305e82c3301", KEY_B
        );
        let ch = channel(&raw, WecomMsgType::Markdown, Arc::new(FakeTransport::new()));
        let ids: Vec<_> = ch.destinations.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec![KEY_A, KEY_B]);
        assert_eq!(ch.destinations[0].endpoint, url(KEY_A));
    }

    #[test]
    fn test_no_valid_keys_is_config_error() {
        let cfg = WecomConfig {
            keys: "nope".into(),
            ..Default::default()
        };
        assert!(WecomChannel::new(&cfg, Arc::new(FakeTransport::new())).is_err());
    }

    #[test]
    fn test_markdown_payload_shape() {
        let ch = channel(KEY_A, WecomMsgType::Markdown, Arc::new(FakeTransport::new()));
        let payload = ch.build_payload(&message());
        assert_eq!(payload["msgtype"], "markdown");
        let content = payload["markdown"]["content"].as_str().unwrap();
        assert!(content.starts_with("**From:** alice@example.com\n"));
        assert!(content.ends_with("code ```12345678```"));
        assert!(payload.get("text").is_none());
    }

    #[test]
    fn test_text_payload_shape() {
        let ch = channel(KEY_A, WecomMsgType::Text, Arc::new(FakeTransport::new()));
        let payload = ch.build_payload(&message());
        assert_eq!(payload["msgtype"], "text");
        let content = payload["text"]["content"].as_str().unwrap();
        assert!(content.starts_with("From: alice@example.com\n"));
        assert!(content.ends_with("code 12345678"));
    }

    #[test]
    fn test_payload_truncated_to_byte_limit() {
        let ch = channel(KEY_A, WecomMsgType::Text, Arc::new(FakeTransport::new()));
        let msg = NormalizedMessage {
            body_text: "验".repeat(2000),
            ..message()
        };
        let payload = ch.build_payload(&msg);
        let content = payload["text"]["content"].as_str().unwrap();
        assert!(content.len() <= TEXT_LIMIT_BYTES);
    }

    #[test]
    fn test_markdown_truncation_closes_fence() {
        let ch = channel(KEY_A, WecomMsgType::Markdown, Arc::new(FakeTransport::new()));
        let header_len = render_markdown(&message()).len() - message().body_markdown.len();
        // Place the fence so the byte limit cuts between its delimiters.
        let body = format!(
            "{}```12345678```{}",
            "x".repeat(MARKDOWN_LIMIT_BYTES - header_len - 5),
            "y".repeat(100)
        );
        let msg = NormalizedMessage {
            body_markdown: body,
            ..message()
        };

        let payload = ch.build_payload(&msg);
        let content = payload["markdown"]["content"].as_str().unwrap();
        assert!(content.len() <= MARKDOWN_LIMIT_BYTES);
        assert!(!content.contains('`'));
        assert!(content.ends_with('x'));
    }

    #[test]
    fn test_check_reply() {
        assert!(check_reply(r#"{"errcode":0,"errmsg":"ok"}"#).is_ok());
        assert!(check_reply("not json").is_ok());
        assert_eq!(
            check_reply(r#"{"errcode":93000,"errmsg":"invalid webhook url"}"#),
            Err(DeliveryError::Rejected {
                code: 93000,
                message: "invalid webhook url".into()
            })
        );
    }

    #[tokio::test]
    async fn test_send_one_outcome_per_key() {
        let transport = Arc::new(
            FakeTransport::new().reply(
                &url(KEY_B),
                200,
                r#"{"errcode":45009,"errmsg":"api freq out of limit"}"#,
            ),
        );
        let keys = format!("{},{}", KEY_A, KEY_B);
        let ch = channel(&keys, WecomMsgType::Markdown, transport.clone());

        let outcomes = ch.send(&message()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_success());
        assert!(matches!(
            outcomes[1].result,
            Err(DeliveryError::Rejected { code: 45009, .. })
        ));
        assert_eq!(transport.urls().await, vec![url(KEY_A), url(KEY_B)]);
    }
}
