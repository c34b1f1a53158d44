use std::sync::Arc;

use base64::prelude::*;
use mailparse::MailHeaderMap;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::channels::DeliveryOutcome;
use crate::dispatcher::Dispatcher;
use crate::forward::MailForwarder;
use crate::normalize::Normalizer;

/// One inbound email event: loosely-typed envelope addresses and the raw message.
///
/// Over JSON the message is carried either as `raw_base64` (byte-exact, needed
/// for 8bit mail in legacy charsets) or as a UTF-8 `raw` string.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "InboundPayload")]
pub struct InboundEmail {
    pub from: String,
    pub to: String,
    pub raw: Vec<u8>,
}

#[derive(Deserialize)]
struct InboundPayload {
    from: String,
    to: String,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    raw_base64: Option<String>,
}

impl TryFrom<InboundPayload> for InboundEmail {
    type Error = String;

    fn try_from(payload: InboundPayload) -> Result<Self, Self::Error> {
        let raw = match (payload.raw_base64, payload.raw) {
            (Some(encoded), None) => BASE64_STANDARD
                .decode(encoded.trim())
                .map_err(|e| format!("raw_base64 is not valid base64: {}", e))?,
            (None, Some(text)) => text.into_bytes(),
            (Some(_), Some(_)) => return Err("set only one of raw and raw_base64".to_string()),
            (None, None) => return Err("missing raw or raw_base64".to_string()),
        };
        Ok(Self {
            from: payload.from,
            to: payload.to,
            raw,
        })
    }
}

impl InboundEmail {
    /// Build an event from a raw message, taking envelope addresses from the
    /// arguments when given and from the From/To headers otherwise.
    pub fn from_raw(raw: Vec<u8>, sender: Option<String>, recipient: Option<String>) -> Self {
        let (from_header, to_header) = match mailparse::parse_headers(&raw) {
            Ok((headers, _)) => (headers.get_first_value("From"), headers.get_first_value("To")),
            Err(e) => {
                warn!("Could not read headers for envelope fallback: {}", e);
                (None, None)
            }
        };

        let pick = |explicit: Option<String>, header: Option<String>| {
            explicit
                .or(header)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        Self {
            from: pick(sender, from_header),
            to: pick(recipient, to_header),
            raw,
        }
    }
}

/// What happened to one inbound email.
#[derive(Debug, Default)]
pub struct RelayReport {
    pub allowlisted: bool,
    pub parse_failed: bool,
    pub outcomes: Vec<DeliveryOutcome>,
    /// `None` when the forward succeeded.
    pub forward_error: Option<String>,
}

impl RelayReport {
    pub fn forwarded(&self) -> bool {
        self.forward_error.is_none()
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

/// Inbound pipeline: allowlist, normalize, notify, then always forward.
pub struct Relay {
    normalizer: Normalizer,
    dispatcher: Dispatcher,
    forwarder: Arc<dyn MailForwarder>,
    forward_to: String,
}

impl Relay {
    pub fn new(
        normalizer: Normalizer,
        dispatcher: Dispatcher,
        forwarder: Arc<dyn MailForwarder>,
        forward_to: String,
    ) -> Self {
        Self {
            normalizer,
            dispatcher,
            forwarder,
            forward_to,
        }
    }

    pub async fn handle(&self, email: &InboundEmail) -> RelayReport {
        let mut report = RelayReport {
            allowlisted: self.normalizer.is_whitelisted(&email.from),
            ..Default::default()
        };

        if !report.allowlisted {
            info!("Sender {} not allowlisted; forwarding only", email.from);
        } else {
            match self.normalizer.normalize(&email.raw) {
                Ok(message) => {
                    info!(
                        "Email from {} ({}) accepted for notification",
                        email.from, message.subject
                    );
                    report.outcomes = self.dispatcher.send(&message).await;
                }
                Err(e) => {
                    error!("Failed to parse email from {}: {:#}", email.from, e);
                    report.parse_failed = true;
                }
            }
        }

        match self.forwarder.forward(email, &self.forward_to).await {
            Ok(()) => info!("Forwarded email from {} to {}", email.from, self.forward_to),
            Err(e) => {
                error!("Failed to forward email from {}: {:#}", email.from, e);
                report.forward_error = Some(format!("{:#}", e));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::allowlist::Allowlist;
    use crate::channels::testing::FakeTransport;
    use crate::channels::{build_channels, TelegramConfig, WecomConfig};
    use crate::forward::testing::RecordingForwarder;
    use crate::highlight::CodeHighlighter;
    use crate::http::HttpTransport;
    use crate::ledger::{DeliveryLedger, MemoryLedger};

    const OTP_EMAIL: &str = "From: Alice <alice@example.com>\r\n\
To: me@example.org\r\n\
Subject: OTP\r\n\
Message-ID: <otp-1@example.com>\r\n\
\r\n\
Your code is 123 456 78, keyword: code\r\n";

    struct Fixture {
        relay: Relay,
        transport: Arc<FakeTransport>,
        ledger: Arc<MemoryLedger>,
        forwarder: Arc<RecordingForwarder>,
    }

    fn fixture(forwarder: RecordingForwarder) -> Fixture {
        let transport = Arc::new(FakeTransport::new());
        let ledger = Arc::new(MemoryLedger::new());
        let forwarder = Arc::new(forwarder);

        let telegram = TelegramConfig {
            bot_token: "123:ABC".into(),
            chat_ids: "42".into(),
            ..Default::default()
        };
        let wecom = WecomConfig {
            keys: "3f2504e0-4f89-11d3-9a0c-0305e82c3301".into(),
            ..Default::default()
        };
        let http: Arc<dyn HttpTransport> = transport.clone();
        let channels = build_channels(Some(&telegram), Some(&wecom), http);

        let relay = Relay::new(
            Normalizer::new(
                Allowlist::parse("example.com"),
                CodeHighlighter::parse("code"),
            ),
            Dispatcher::new(channels, ledger.clone(), Duration::from_secs(3600)),
            forwarder.clone(),
            "me@example.org".to_string(),
        );

        Fixture {
            relay,
            transport,
            ledger,
            forwarder,
        }
    }

    fn email(from: &str, raw: &str) -> InboundEmail {
        InboundEmail {
            from: from.to_string(),
            to: "inbox@example.net".to_string(),
            raw: raw.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_allowlisted_email_notifies_and_forwards() {
        let f = fixture(RecordingForwarder::default());

        let report = f.relay.handle(&email("alice@example.com", OTP_EMAIL)).await;

        assert!(report.allowlisted);
        assert!(!report.parse_failed);
        assert_eq!(report.delivered(), 2);
        assert_eq!(report.failed(), 0);
        assert!(report.forwarded());
        assert!(f.ledger.get("<otp-1@example.com>").await.unwrap().is_some());
        assert_eq!(f.ledger.len().await, 1);
        assert_eq!(f.forwarder.count().await, 1);

        let requests = f.transport.requests.lock().await;
        assert_eq!(requests.len(), 2);
        let telegram_text = requests[0].1["text"].as_str().unwrap();
        assert!(telegram_text.contains("```12345678```"));
    }

    #[tokio::test]
    async fn test_not_allowlisted_only_forwards() {
        let f = fixture(RecordingForwarder::default());

        let report = f.relay.handle(&email("eve@evil.com", OTP_EMAIL)).await;

        assert!(!report.allowlisted);
        assert!(report.outcomes.is_empty());
        assert!(report.forwarded());
        assert!(f.transport.requests.lock().await.is_empty());
        assert_eq!(f.ledger.len().await, 0);
        assert_eq!(f.forwarder.count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_forwards_without_notifying() {
        let f = fixture(RecordingForwarder::default());
        let inbound = email("alice@example.com", OTP_EMAIL);

        f.relay.handle(&inbound).await;
        let second = f.relay.handle(&inbound).await;

        assert!(second.outcomes.is_empty());
        assert_eq!(f.transport.requests.lock().await.len(), 2);
        assert_eq!(f.forwarder.count().await, 2);
    }

    #[tokio::test]
    async fn test_forward_failure_is_reported() {
        let f = fixture(RecordingForwarder::failing());

        let report = f.relay.handle(&email("alice@example.com", OTP_EMAIL)).await;

        assert_eq!(report.delivered(), 2);
        assert!(!report.forwarded());
        assert!(report.forward_error.unwrap().contains("mailbox unavailable"));
        assert_eq!(f.forwarder.count().await, 1);
    }

    #[test]
    fn test_from_raw_falls_back_to_headers() {
        let inbound = InboundEmail::from_raw(OTP_EMAIL.as_bytes().to_vec(), None, None);
        assert_eq!(inbound.from, "Alice <alice@example.com>");
        assert_eq!(inbound.to, "me@example.org");

        let inbound = InboundEmail::from_raw(
            OTP_EMAIL.as_bytes().to_vec(),
            Some("bounce@example.com".into()),
            None,
        );
        assert_eq!(inbound.from, "bounce@example.com");
    }

    #[test]
    fn test_inbound_email_from_json() {
        let json = r#"{"from":"a@example.com","to":"b@example.org","raw":"Subject: hi\r\n\r\nbody"}"#;
        let inbound: InboundEmail = serde_json::from_str(json).unwrap();
        assert_eq!(inbound.raw, b"Subject: hi\r\n\r\nbody");
    }

    /// GBK-encoded 8bit body: not valid UTF-8.
    fn gbk_email() -> Vec<u8> {
        let mut raw = b"From: alice@example.com\r\n\
Subject: code\r\n\
Content-Type: text/plain; charset=gbk\r\n\
Content-Transfer-Encoding: 8bit\r\n\
\r\n"
            .to_vec();
        raw.extend_from_slice(&[0xd1, 0xe9, 0xd6, 0xa4, 0xc2, 0xeb]);
        raw.extend_from_slice(b" 123456\r\n");
        raw
    }

    #[test]
    fn test_inbound_email_from_base64_json() {
        let raw = gbk_email();
        assert!(std::str::from_utf8(&raw).is_err());
        let json = serde_json::json!({
            "from": "alice@example.com",
            "to": "inbox@example.net",
            "raw_base64": BASE64_STANDARD.encode(&raw),
        });

        let inbound: InboundEmail = serde_json::from_value(json).unwrap();
        assert_eq!(inbound.raw, raw);
    }

    #[test]
    fn test_inbound_email_rejects_bad_payloads() {
        let both = r#"{"from":"a@x.com","to":"b@y.org","raw":"x","raw_base64":"eA=="}"#;
        assert!(serde_json::from_str::<InboundEmail>(both).is_err());

        let neither = r#"{"from":"a@x.com","to":"b@y.org"}"#;
        assert!(serde_json::from_str::<InboundEmail>(neither).is_err());

        let garbled = r#"{"from":"a@x.com","to":"b@y.org","raw_base64":"***"}"#;
        assert!(serde_json::from_str::<InboundEmail>(garbled).is_err());
    }

    #[tokio::test]
    async fn test_8bit_email_forwarded_byte_for_byte() {
        let f = fixture(RecordingForwarder::default());
        let raw = gbk_email();
        let inbound = InboundEmail {
            from: "alice@example.com".to_string(),
            to: "inbox@example.net".to_string(),
            raw: raw.clone(),
        };

        let report = f.relay.handle(&inbound).await;

        assert!(report.forwarded());
        let forwarded = f.forwarder.forwarded.lock().await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0.raw, raw);
        assert_eq!(forwarded[0].1, "me@example.org");
    }

    #[tokio::test]
    async fn test_unparseable_email_is_still_forwarded_once() {
        let f = fixture(RecordingForwarder::default());
        let raw = "From: alice@example.com\r\n\
Subject: code\r\n\
Message-ID: <broken@example.com>\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
@@@@ not base64 !!!!\r\n";

        let report = f.relay.handle(&email("alice@example.com", raw)).await;

        assert!(report.allowlisted);
        assert!(report.parse_failed);
        assert!(report.outcomes.is_empty());
        assert!(report.forwarded());
        assert!(f.transport.requests.lock().await.is_empty());
        assert_eq!(f.ledger.len().await, 0);
        assert_eq!(f.forwarder.count().await, 1);
    }
}
