use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::channels::{DeliveryOutcome, NotificationChannel};
use crate::error::DeliveryError;
use crate::ledger::{DeliveryLedger, SENT};
use crate::message::NormalizedMessage;

pub const DEFAULT_TTL_SECS: u64 = 86_400;

/// Deduplicates by message id and fans each message out to every channel.
pub struct Dispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    ledger: Arc<dyn DeliveryLedger>,
    ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        ledger: Arc<dyn DeliveryLedger>,
        ttl: Duration,
    ) -> Self {
        if channels.is_empty() {
            warn!("Dispatcher has no channels; no notifications will be sent");
        }
        Self {
            channels,
            ledger,
            ttl,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Notify every channel about `message` unless its id was already handled.
    ///
    /// Returns an empty list for a duplicate. Otherwise returns the outcomes of
    /// all channels, flattened in channel order then destination order. The id
    /// is recorded after every send has settled, whatever the outcomes.
    pub async fn send(&self, message: &NormalizedMessage) -> Vec<DeliveryOutcome> {
        let message_id = message.message_id.as_deref();

        match message_id {
            None => warn!("Message has no Message-ID; sending without deduplication"),
            Some(id) => match self.ledger.get(id).await {
                Ok(Some(_)) => {
                    info!("Message {} already notified, skipping", id);
                    return Vec::new();
                }
                Ok(None) => debug!("Message {} not seen before", id),
                Err(e) => warn!("Ledger lookup for {} failed, sending anyway: {:#}", id, e),
            },
        }

        let sends = self.channels.iter().map(|channel| async move {
            let name = channel.name();
            match AssertUnwindSafe(channel.send(message)).catch_unwind().await {
                Ok(outcomes) => outcomes,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("Channel '{}' panicked: {}", name, reason);
                    vec![DeliveryOutcome {
                        channel: name,
                        destination: "*".to_string(),
                        result: Err(DeliveryError::Panicked(reason)),
                    }]
                }
            }
        });
        let outcomes: Vec<DeliveryOutcome> = join_all(sends).await.into_iter().flatten().collect();

        if let Some(id) = message_id {
            match self.ledger.put(id, SENT, self.ttl).await {
                Ok(()) => debug!("Recorded {} in ledger for {:?}", id, self.ttl),
                Err(e) => error!("Failed to record {} in ledger: {:#}", id, e),
            }
        }

        let delivered = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            "Dispatched to {} destination(s): {} delivered, {} failed",
            outcomes.len(),
            delivered,
            outcomes.len() - delivered
        );

        outcomes
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
