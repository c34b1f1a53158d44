mod allowlist;
mod channels;
mod config;
mod dispatcher;
mod error;
mod forward;
mod highlight;
mod http;
mod ledger;
mod maintenance;
mod message;
mod normalize;
mod relay;
mod server;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::allowlist::Allowlist;
use crate::config::{Config, LedgerBackend};
use crate::dispatcher::Dispatcher;
use crate::forward::SmtpForwarder;
use crate::highlight::CodeHighlighter;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::ledger::{DeliveryLedger, MemoryLedger, SqliteLedger};
use crate::maintenance::Maintenance;
use crate::normalize::Normalizer;
use crate::relay::{InboundEmail, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mailrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // `mailrelay [config]` serves HTTP; `mailrelay pipe [config]` handles one email from stdin
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let pipe_mode = args.first().is_some_and(|a| a == "pipe");
    if pipe_mode {
        args.remove(0);
    }
    let config_path = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Forward to: {}", config.relay.forward_to);
    info!("  Ledger: {:?} (ttl {}s)", config.ledger.backend, config.ledger.ttl_seconds);
    info!("  SMTP: {}:{}", config.smtp.host, config.smtp.port);

    let ledger: Arc<dyn DeliveryLedger> = match config.ledger.backend {
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::open(&config.ledger.database_path)?),
        LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
    };

    let relay = Arc::new(build_relay(&config, Arc::clone(&ledger))?);

    if pipe_mode {
        return run_pipe(&relay).await;
    }

    let maintenance = Maintenance::new(ledger).await?;
    maintenance.start().await?;

    info!("Relay is starting...");
    server::serve(&config.server.bind, relay, config.auth_token()).await?;

    Ok(())
}

fn build_relay(config: &Config, ledger: Arc<dyn DeliveryLedger>) -> Result<Relay> {
    let allowlist = Allowlist::parse(&config.relay.allowed_senders);
    if allowlist.is_empty() {
        bail!("relay.allowed_senders has no usable entries");
    }
    let highlighter = CodeHighlighter::parse(&config.relay.code_keywords);
    if highlighter.is_empty() {
        bail!("relay.code_keywords has no usable entries");
    }
    info!("  Allowlist: {} entries", allowlist.len());

    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(config.http.timeout())?);
    let channels = channels::build_channels(
        config.telegram.as_ref(),
        config.wecom.as_ref(),
        transport,
    );
    let dispatcher = Dispatcher::new(channels, ledger, config.ledger.ttl());
    info!("  Channels: {}", dispatcher.channel_count());

    let forwarder = Arc::new(SmtpForwarder::new(&config.smtp)?);

    Ok(Relay::new(
        Normalizer::new(allowlist, highlighter),
        dispatcher,
        forwarder,
        config.relay.forward_to.clone(),
    ))
}

async fn run_pipe(relay: &Relay) -> Result<()> {
    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("Failed to read email from stdin")?;

    let email = InboundEmail::from_raw(
        raw,
        std::env::var("MAILRELAY_SENDER").ok(),
        std::env::var("MAILRELAY_RECIPIENT").ok(),
    );
    info!("Handling piped email from {} to {}", email.from, email.to);

    let report = relay.handle(&email).await;
    if let Some(e) = report.forward_error {
        error!("Email was not forwarded");
        bail!("Forward failed: {}", e);
    }
    Ok(())
}
