use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::DateTime;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use tracing::debug;

use crate::allowlist::Allowlist;
use crate::highlight::CodeHighlighter;
use crate::message::{NormalizedMessage, NO_CONTENT, NO_SUBJECT, UNKNOWN_RECIPIENT, UNKNOWN_SENDER};

static HIDDEN_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(style|script|head)\b.*?</(style|script|head)>").unwrap());
static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6])>").unwrap());
static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Turns raw RFC 5322 bytes into a `NormalizedMessage` and gates senders.
#[derive(Debug, Clone)]
pub struct Normalizer {
    allowlist: Allowlist,
    highlighter: CodeHighlighter,
}

impl Normalizer {
    pub fn new(allowlist: Allowlist, highlighter: CodeHighlighter) -> Self {
        Self {
            allowlist,
            highlighter,
        }
    }

    pub fn is_whitelisted(&self, from: &str) -> bool {
        self.allowlist.is_whitelisted(from)
    }

    pub fn normalize(&self, raw: &[u8]) -> Result<NormalizedMessage> {
        let parsed = mailparse::parse_mail(raw).context("Failed to parse MIME message")?;
        let headers = &parsed.headers;

        let header = |name: &str| -> Option<String> {
            headers
                .get_first_value(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let sent_at = header("Date").and_then(|d| match mailparse::dateparse(&d) {
            Ok(ts) => DateTime::from_timestamp(ts, 0),
            Err(e) => {
                debug!("Unparseable Date header {:?}: {}", d, e);
                None
            }
        });

        let text_part = find_part(&parsed, "text/plain")
            .map(|p| p.get_body())
            .transpose()
            .context("Failed to decode text/plain part")?;
        let html = find_part(&parsed, "text/html")
            .map(|p| p.get_body())
            .transpose()
            .context("Failed to decode text/html part")?;

        let body = text_part
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| html.as_deref().map(strip_html).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| NO_CONTENT.to_string());

        Ok(NormalizedMessage {
            from: header("From").unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            to: header("To").unwrap_or_else(|| UNKNOWN_RECIPIENT.to_string()),
            subject: header("Subject").unwrap_or_else(|| NO_SUBJECT.to_string()),
            body_text: self.highlighter.process(&body, false),
            body_markdown: self.highlighter.process(&body, true),
            html,
            sent_at,
            message_id: header("Message-ID"),
            in_reply_to: header("In-Reply-To"),
            references: header("References"),
        })
    }
}

/// Depth-first search for the first inline part of the given MIME type.
fn find_part<'a>(part: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if part.subparts.is_empty() {
        let inline = part.get_content_disposition().disposition != DispositionType::Attachment;
        return (inline && part.ctype.mimetype.eq_ignore_ascii_case(mimetype)).then_some(part);
    }
    part.subparts.iter().find_map(|p| find_part(p, mimetype))
}

pub fn strip_html(html: &str) -> String {
    let text = HIDDEN_BLOCKS.replace_all(html, "");
    let text = LINE_BREAKS.replace_all(&text, "\n");
    let text = TAGS.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
