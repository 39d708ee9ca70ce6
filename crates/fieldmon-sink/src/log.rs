use async_trait::async_trait;
use fieldmon_batch::Flusher;
use fieldmon_common::MetricData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Development sink: logs each batch instead of shipping it.
#[derive(Default)]
pub struct LogSink {
    batches: AtomicU64,
    items: AtomicU64,
}

impl LogSink {
    pub fn items_flushed(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Flusher for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn flush(&self, batch: &[MetricData]) -> anyhow::Result<()> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(batch.len() as u64, Ordering::Relaxed);
        tracing::info!(size = batch.len(), "Batch flushed to log sink");
        for data in batch {
            tracing::debug!(
                device_id = %data.device_id,
                metrics = data.metrics.len(),
                quality = %data.quality,
                "Flushed metric data"
            );
        }
        Ok(())
    }
}
