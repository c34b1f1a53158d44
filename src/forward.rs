//! Forwarding of the original email.
//!
//! The raw message bytes are relayed unmodified to the forward-to address
//! over SMTP, keeping the original sender as the envelope reverse-path.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::allowlist::bare_address;
use crate::relay::InboundEmail;

#[async_trait]
pub trait MailForwarder: Send + Sync {
    async fn forward(&self, email: &InboundEmail, to: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    #[default]
    Starttls,
    Tls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    587
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: TlsMode::default(),
            username: None,
            password: None,
        }
    }
}

pub struct SmtpForwarder {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpForwarder {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let host = config.host.as_str();
        let builder = match config.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            TlsMode::Starttls | TlsMode::Tls => {
                let params = TlsParameters::new(host.to_string())
                    .with_context(|| format!("Invalid TLS parameters for {}", host))?;
                let tls = if config.tls == TlsMode::Tls {
                    Tls::Wrapper(params)
                } else {
                    Tls::Required(params)
                };
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).tls(tls)
            }
        }
        .port(config.port);

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            (None, None) => builder,
            _ => bail!("smtp.username and smtp.password must be set together"),
        };

        info!(
            "SMTP forwarder configured: {}:{} ({:?})",
            config.host, config.port, config.tls
        );
        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailForwarder for SmtpForwarder {
    async fn forward(&self, email: &InboundEmail, to: &str) -> Result<()> {
        let envelope = build_envelope(&email.from, to)?;
        self.transport
            .send_raw(&envelope, &email.raw)
            .await
            .with_context(|| format!("SMTP relay to {} failed", to))?;
        debug!("Forwarded {} bytes to {}", email.raw.len(), to);
        Ok(())
    }
}

/// Envelope keeping the original sender; a null reverse-path if it does not parse.
pub fn build_envelope(from: &str, to: &str) -> Result<Envelope> {
    let recipient: Address = bare_address(to)
        .parse()
        .with_context(|| format!("Invalid forward-to address: {}", to))?;

    let sender = match bare_address(from).parse::<Address>() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("Envelope sender {:?} unusable ({}); using null reverse-path", from, e);
            None
        }
    };

    Envelope::new(sender, vec![recipient]).context("Failed to build SMTP envelope")
}
