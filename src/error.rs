use thiserror::Error;

/// Raised while building a notification channel from its configuration.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{channel} configuration error: {message}")]
    Config {
        channel: &'static str,
        message: String,
    },
}

impl ChannelError {
    pub fn config(channel: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            channel,
            message: message.into(),
        }
    }
}

/// Failure to deliver to a single destination. Recorded, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider rejected message (errcode {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel panicked: {0}")]
    Panicked(String),
}

/// Network-level failure reported by an `HttpTransport`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<TransportError> for DeliveryError {
    fn from(e: TransportError) -> Self {
        DeliveryError::Transport(e.0)
    }
}
