//! In-memory aggregation of collected metrics with three flush triggers:
//! batch size, estimated memory, and a timer. Failed flushes are handed to a
//! [`SpillSink`] so a downstream outage never drops data on the floor.

pub mod batcher;
pub mod buffer;


use async_trait::async_trait;
use fieldmon_common::MetricData;

pub use batcher::{BatchConfig, Batcher, BatcherStats};
pub use buffer::MetricBuffer;

/// Downstream sink for drained batches.
#[async_trait]
pub trait Flusher: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers one batch. An error means the whole batch is considered
    /// undelivered and will be spilled.
    async fn flush(&self, batch: &[MetricData]) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Overflow store for batches the flusher could not deliver.
#[async_trait]
pub trait SpillSink: Send + Sync {
    async fn spill(&self, batch: &[MetricData]) -> anyhow::Result<()>;
}
