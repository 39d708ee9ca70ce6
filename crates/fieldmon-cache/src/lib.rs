//! Local persistent spill cache.
//!
//! Batches the sink could not accept land here keyed by
//! `metric:<device_id>:<ts_nanos>` with a TTL; the agent's retry loop drains
//! the cache once the sink recovers, and a periodic GC removes expired
//! entries and compacts the store.

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::Utc;
use fieldmon_batch::SpillSink;
use fieldmon_common::MetricData;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub path: String,
    /// Per-entry TTL in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// GC period in seconds.
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
    /// Retry-loop period in seconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
}

fn default_ttl() -> u64 {
    3600
}

fn default_gc_interval() -> u64 {
    600
}

fn default_retry_interval() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: "data/cache".to_string(),
            ttl: default_ttl(),
            gc_interval: default_gc_interval(),
            retry_interval: default_retry_interval(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// TTL'd key-value store for spilled metric data, backed by a single SQLite
/// file. Thread-safe through an internal connection mutex; all statements
/// are short so the blocking window stays small.
pub struct SpillCache {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl SpillCache {
    pub fn open(cfg: &CacheConfig) -> Result<Self, CacheError> {
        let dir = Path::new(&cfg.path);
        std::fs::create_dir_all(dir)?;

        let conn = Connection::open(dir.join("spill.db"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS spill (
                 key        TEXT PRIMARY KEY,
                 device_id  TEXT NOT NULL,
                 ts_nanos   INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL,
                 payload    TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_spill_expires ON spill (expires_at);",
        )?;

        tracing::info!(path = %cfg.path, ttl_secs = cfg.ttl, "Spill cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
            ttl: Duration::from_secs(cfg.ttl),
        })
    }

    fn key_for(metric: &MetricData) -> String {
        format!("metric:{}:{}", metric.device_id, ts_nanos(metric))
    }

    pub fn store(&self, metric: &MetricData) -> Result<(), CacheError> {
        let payload = serde_json::to_string(metric)?;
        let expires_at = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO spill (key, device_id, ts_nanos, expires_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                Self::key_for(metric),
                metric.device_id,
                ts_nanos(metric),
                expires_at,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Stores a whole batch in one transaction.
    pub fn store_batch(&self, batch: &[MetricData]) -> Result<usize, CacheError> {
        let expires_at = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut stored = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO spill (key, device_id, ts_nanos, expires_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for metric in batch {
                let payload = match serde_json::to_string(metric) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(device_id = %metric.device_id, error = %e, "Failed to encode metric");
                        continue;
                    }
                };
                stmt.execute(rusqlite::params![
                    Self::key_for(metric),
                    metric.device_id,
                    ts_nanos(metric),
                    expires_at,
                    payload,
                ])?;
                stored += 1;
            }
        }
        tx.commit()?;
        tracing::debug!(count = stored, "Stored batch in spill cache");
        Ok(stored)
    }

    /// Returns every live entry with its key, oldest first. Entries past
    /// their TTL are skipped even if GC has not removed them yet.
    pub fn get_all(&self) -> Result<Vec<(String, MetricData)>, CacheError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT key, payload FROM spill WHERE expires_at > ?1 ORDER BY ts_nanos ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, payload) = row?;
            match serde_json::from_str::<MetricData>(&payload) {
                Ok(metric) => entries.push((key, metric)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to decode cached metric");
                }
            }
        }
        Ok(entries)
    }

    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM spill WHERE key = ?1", rusqlite::params![key])?;
        Ok(removed > 0)
    }

    /// Removes entries whose collection timestamp is older than `age`.
    pub fn delete_older_than(&self, age: Duration) -> Result<usize, CacheError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(age.as_secs() as i64);
        let cutoff_nanos = cutoff
            .timestamp_nanos_opt()
            .unwrap_or_else(|| cutoff.timestamp_millis().saturating_mul(1_000_000));
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM spill WHERE ts_nanos < ?1",
            rusqlite::params![cutoff_nanos],
        )?;
        Ok(removed)
    }

    /// Removes entries past their TTL.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM spill WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(removed)
    }

    pub fn size(&self) -> Result<u64, CacheError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM spill", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn compact(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Periodic GC: drop expired entries and compact the log.
    pub async fn run_gc(&self, period: Duration, cancel: CancellationToken) {
        let mut tick = interval(period.max(Duration::from_secs(1)));
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    tracing::debug!("Running spill cache GC");
                    match self.purge_expired() {
                        Ok(removed) if removed > 0 => {
                            tracing::info!(removed, "Purged expired spill entries");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Spill cache GC failed"),
                    }
                    if let Err(e) = self.compact() {
                        tracing::warn!(error = %e, "Spill cache compaction failed");
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        tracing::info!("Closing spill cache");
        if let Err(e) = self.compact() {
            tracing::debug!(error = %e, "Final compaction failed");
        }
    }
}

fn ts_nanos(metric: &MetricData) -> i64 {
    metric
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| metric.timestamp.timestamp_millis().saturating_mul(1_000_000))
}

#[async_trait]
impl SpillSink for SpillCache {
    async fn spill(&self, batch: &[MetricData]) -> anyhow::Result<()> {
        self.store_batch(batch)?;
        Ok(())
    }
}
