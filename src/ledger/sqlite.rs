use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use super::DeliveryLedger;

/// Durable ledger backed by a SQLite table with per-row expiry.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open or create the ledger database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Delivery ledger initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS delivery_ledger (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_delivery_ledger_expiry
                ON delivery_ledger(expires_at);
            ",
        )
        .context("Failed to create delivery_ledger table")?;
        Ok(())
    }

    /// Upsert with an absolute expiry; `put` derives it from a TTL.
    async fn put_until(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO delivery_ledger (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at.timestamp()],
        )
        .context("Failed to write ledger entry")?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryLedger for SqliteLedger {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT value FROM delivery_ledger WHERE key = ?1 AND expires_at > ?2")
            .context("Failed to prepare ledger lookup")?;
        let mut rows = stmt
            .query_map(rusqlite::params![key, Utc::now().timestamp()], |row| row.get(0))
            .context("Failed to query ledger")?;
        match rows.next() {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => Err(e).context("Failed to read ledger entry"),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).context("Ledger TTL out of range")?;
        self.put_until(key, value, Utc::now() + ttl).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM delivery_ledger WHERE expires_at <= ?1",
                rusqlite::params![Utc::now().timestamp()],
            )
            .context("Failed to purge expired ledger entries")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SENT;

    #[tokio::test]
    async fn test_put_then_get() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(ledger.get("<a@b>").await.unwrap(), None);

        ledger.put("<a@b>", SENT, Duration::from_secs(60)).await.unwrap();
        assert_eq!(ledger.get("<a@b>").await.unwrap().as_deref(), Some(SENT));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let past = Utc::now() - chrono::Duration::seconds(5);
        ledger.put_until("<old@b>", SENT, past).await.unwrap();

        assert_eq!(ledger.get("<old@b>").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_after_expiry_recreates() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let past = Utc::now() - chrono::Duration::seconds(5);
        ledger.put_until("<k@b>", SENT, past).await.unwrap();
        ledger.put("<k@b>", SENT, Duration::from_secs(60)).await.unwrap();

        assert_eq!(ledger.get("<k@b>").await.unwrap().as_deref(), Some(SENT));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let past = Utc::now() - chrono::Duration::seconds(5);
        ledger.put_until("<old1@b>", SENT, past).await.unwrap();
        ledger.put_until("<old2@b>", SENT, past).await.unwrap();
        ledger.put("<new@b>", SENT, Duration::from_secs(60)).await.unwrap();

        assert_eq!(ledger.purge_expired().await.unwrap(), 2);
        assert_eq!(ledger.purge_expired().await.unwrap(), 0);
        assert!(ledger.get("<new@b>").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_file_persists() {
        let path = std::env::temp_dir().join(format!("mailrelay-ledger-{}.db", std::process::id()));
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            ledger.put("<p@b>", SENT, Duration::from_secs(60)).await.unwrap();
        }
        let reopened = SqliteLedger::open(&path).unwrap();
        assert!(reopened.get("<p@b>").await.unwrap().is_some());

        drop(reopened);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }
}
