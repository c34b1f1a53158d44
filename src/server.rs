//! Inbound webhook server.
//!
//! An upstream MTA (or a mail-hook script) POSTs each received email to
//! `/inbound` as JSON `{ from, to, raw_base64 }`, or with a UTF-8 `raw` string in
//! place of `raw_base64`. The response status tells the caller whether the
//! original was forwarded: 200 if so, 502 otherwise so it retries.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::relay::{InboundEmail, Relay, RelayReport};

pub const AUTH_HEADER: &str = "x-relay-token";

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    auth_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundSummary {
    pub allowlisted: bool,
    pub parse_failed: bool,
    pub delivered: usize,
    pub failed: usize,
    pub forwarded: bool,
}

impl From<&RelayReport> for InboundSummary {
    fn from(report: &RelayReport) -> Self {
        Self {
            allowlisted: report.allowlisted,
            parse_failed: report.parse_failed,
            delivered: report.delivered(),
            failed: report.failed(),
            forwarded: report.forwarded(),
        }
    }
}

pub fn router(relay: Arc<Relay>, auth_token: Option<String>) -> Router {
    let state = AppState { relay, auth_token };
    Router::new()
        .route("/health", get(health))
        .route("/inbound", post(inbound))
        .with_state(state)
}

pub async fn serve(bind: &str, relay: Arc<Relay>, auth_token: Option<String>) -> Result<()> {
    if auth_token.is_none() {
        warn!("No auth token configured; /inbound accepts unauthenticated requests");
    }

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;
    info!("Listening for inbound email on http://{}", bind);

    axum::serve(listener, router(relay, auth_token))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(email): Json<InboundEmail>,
) -> Response {
    if let Some(expected) = &state.auth_token {
        let presented = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            warn!("Rejected inbound request from {}: bad or missing token", email.from);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let report = state.relay.handle(&email).await;
    let status = if report.forwarded() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(InboundSummary::from(&report))).into_response()
}
