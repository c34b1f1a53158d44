//! Background upkeep for a long-running relay: expired ledger rows are purged
//! and a heartbeat is logged, each on its own cron schedule.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::ledger::DeliveryLedger;

/// Top of every hour (seconds-first cron syntax).
pub const PURGE_SCHEDULE: &str = "0 0 * * * *";
/// Half past every hour, so the heartbeat never lands on a purge.
pub const HEARTBEAT_SCHEDULE: &str = "0 30 * * * *";

/// Owns the cron scheduler and the ledger it keeps tidy.
pub struct Maintenance {
    scheduler: JobScheduler,
    ledger: Arc<dyn DeliveryLedger>,
}

impl Maintenance {
    pub async fn new(ledger: Arc<dyn DeliveryLedger>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { scheduler, ledger })
    }

    /// Register the purge and heartbeat jobs and start running them.
    pub async fn start(&self) -> Result<()> {
        let ledger = Arc::clone(&self.ledger);
        let purge = Job::new_async(PURGE_SCHEDULE, move |_uuid, _lock| {
            let ledger = Arc::clone(&ledger);
            Box::pin(async move {
                purge_expired_entries(ledger.as_ref()).await;
            })
        })
        .context("Failed to create ledger purge job")?;

        let heartbeat = Job::new_async(HEARTBEAT_SCHEDULE, |_uuid, _lock| {
            Box::pin(async {
                info!("Heartbeat: relay is alive");
            })
        })
        .context("Failed to create heartbeat job")?;

        for (name, job) in [("ledger-purge", purge), ("heartbeat", heartbeat)] {
            self.scheduler
                .add(job)
                .await
                .with_context(|| format!("Failed to add job: {}", name))?;
        }

        self.scheduler
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!(
            "Maintenance started: purge '{}', heartbeat '{}'",
            PURGE_SCHEDULE, HEARTBEAT_SCHEDULE
        );
        Ok(())
    }
}

/// One purge pass. Failures are logged; the next pass retries.
pub async fn purge_expired_entries(ledger: &dyn DeliveryLedger) -> usize {
    match ledger.purge_expired().await {
        Ok(0) => 0,
        Ok(n) => {
            info!("Purged {} expired ledger entries", n);
            n
        }
        Err(e) => {
            error!("Ledger purge failed: {:#}", e);
            0
        }
    }
}
