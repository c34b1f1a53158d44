use chrono::{DateTime, Utc};

pub const UNKNOWN_SENDER: &str = "Unknown Sender";
pub const UNKNOWN_RECIPIENT: &str = "Unknown Recipient";
pub const NO_SUBJECT: &str = "No Subject";
pub const NO_CONTENT: &str = "No Content";

/// Canonical record produced once per inbound email.
///
/// `body_text` and `body_markdown` hold the same processed body, with
/// verification codes highlighted for plain text and markdown respectively.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub body_markdown: String,
    pub html: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Deduplication key. `None` disables deduplication for this message.
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

impl Default for NormalizedMessage {
    fn default() -> Self {
        Self {
            from: UNKNOWN_SENDER.to_string(),
            to: UNKNOWN_RECIPIENT.to_string(),
            subject: NO_SUBJECT.to_string(),
            body_text: NO_CONTENT.to_string(),
            body_markdown: NO_CONTENT.to_string(),
            html: None,
            sent_at: None,
            message_id: None,
            in_reply_to: None,
            references: None,
        }
    }
}

/// Header lines shared by every rendering: label and value, Date only when known.
pub fn header_fields(message: &NormalizedMessage) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("From", message.from.clone()),
        ("To", message.to.clone()),
        ("Subject", message.subject.clone()),
    ];
    if let Some(sent_at) = message.sent_at {
        fields.push(("Date", format_date(&sent_at)));
    }
    fields
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Plain-text view: `Label: value` headers, a blank line, then the body.
pub fn render_plain_text(message: &NormalizedMessage) -> String {
    let mut out = String::new();
    for (label, value) in header_fields(message) {
        out.push_str(&format!("{}: {}\n", label, value));
    }
    out.push('\n');
    out.push_str(&message.body_text);
    out
}

/// Markdown view: bold labels, a blank line, then the markdown body.
pub fn render_markdown(message: &NormalizedMessage) -> String {
    let mut out = String::new();
    for (label, value) in header_fields(message) {
        out.push_str(&format!("**{}:** {}\n", label, value));
    }
    out.push('\n');
    out.push_str(&message.body_markdown);
    out
}
