pub mod memory;
pub mod sqlite;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Value stored under a message id once notification has been handled.
pub const SENT: &str = "sent";

/// Expiring key-value store recording which message ids were already notified.
///
/// `get` followed by `put` is not atomic: two concurrent deliveries of the
/// same message id can both observe "absent".
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous entry, expiring after `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
