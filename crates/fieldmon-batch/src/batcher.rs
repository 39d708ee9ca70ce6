use crate::buffer::MetricBuffer;
use crate::{Flusher, SpillSink};
use fieldmon_common::MetricData;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Timer flush period in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Memory trigger in MB; 0 disables it.
    #[serde(default)]
    pub max_memory_mb: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_interval() -> u64 {
    10
}

fn default_max_size() -> usize {
    1000
}

fn default_queue_size() -> usize {
    10000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_size: default_max_size(),
            max_memory_mb: 0,
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    items_received: AtomicU64,
    items_dropped: AtomicU64,
    items_flushed: AtomicU64,
    items_spilled: AtomicU64,
    items_lost: AtomicU64,
    flush_count: AtomicU64,
    flush_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherStats {
    pub items_received: u64,
    pub items_dropped: u64,
    pub items_flushed: u64,
    pub items_spilled: u64,
    pub items_lost: u64,
    pub flush_count: u64,
    pub flush_errors: u64,
    pub buffer_size: usize,
    pub buffer_memory_bytes: u64,
}

/// State shared between the batcher handle and its two loops.
struct Shared {
    cfg: BatchConfig,
    buffer: MetricBuffer,
    flusher: Arc<dyn Flusher>,
    spill: Arc<dyn SpillSink>,
    cancel: CancellationToken,
    counters: Counters,
}

/// Aggregates metric data and flushes it downstream.
///
/// Two cooperating loops share the buffer: the collector loop drains the
/// input channel and triggers size/memory flushes, the timer loop flushes
/// every `interval` regardless. On flusher failure the drained batch goes to
/// the spill sink; each drained batch therefore reaches the sink or the
/// spill exactly once. The batcher runs on its own token so the final flush
/// happens after the producers have drained.
pub struct Batcher {
    shared: Arc<Shared>,
    input_tx: mpsc::Sender<MetricData>,
    input_rx: parking_lot::Mutex<Option<mpsc::Receiver<MetricData>>>,
    loops: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl Batcher {
    pub fn new(cfg: BatchConfig, flusher: Arc<dyn Flusher>, spill: Arc<dyn SpillSink>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(cfg.queue_size.max(1));
        Self {
            shared: Arc::new(Shared {
                cfg,
                buffer: MetricBuffer::new(),
                flusher,
                spill,
                cancel: CancellationToken::new(),
                counters: Counters::default(),
            }),
            input_tx,
            input_rx: parking_lot::Mutex::new(Some(input_rx)),
            loops: parking_lot::Mutex::new(None),
        }
    }

    /// Non-blocking ingest; drops the newest item with a warning when the
    /// input channel is full.
    pub fn add(&self, metric: MetricData) {
        match self.input_tx.try_send(metric) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(metric)) => {
                self.shared
                    .counters
                    .items_dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    device_id = %metric.device_id,
                    "Batcher input queue full, dropping metric"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn start(&self) {
        tracing::info!(
            interval_secs = self.shared.cfg.interval,
            max_size = self.shared.cfg.max_size,
            max_memory_mb = self.shared.cfg.max_memory_mb,
            "Starting batcher"
        );

        let Some(input_rx) = self.input_rx.lock().take() else {
            tracing::warn!("Batcher already started");
            return;
        };

        let mut loops = JoinSet::new();
        let collector = self.shared.clone();
        loops.spawn(async move { collector.collect_loop(input_rx).await });
        let timer = self.shared.clone();
        loops.spawn(async move { timer.timer_loop().await });
        *self.loops.lock() = Some(loops);
    }

    pub fn stats(&self) -> BatcherStats {
        let counters = &self.shared.counters;
        BatcherStats {
            items_received: counters.items_received.load(Ordering::Relaxed),
            items_dropped: counters.items_dropped.load(Ordering::Relaxed),
            items_flushed: counters.items_flushed.load(Ordering::Relaxed),
            items_spilled: counters.items_spilled.load(Ordering::Relaxed),
            items_lost: counters.items_lost.load(Ordering::Relaxed),
            flush_count: counters.flush_count.load(Ordering::Relaxed),
            flush_errors: counters.flush_errors.load(Ordering::Relaxed),
            buffer_size: self.shared.buffer.len(),
            buffer_memory_bytes: self.shared.buffer.memory_bytes(),
        }
    }

    /// Stops both loops; the collector performs a final flush on its way out.
    pub async fn stop(&self) {
        tracing::info!("Stopping batcher");
        self.shared.cancel.cancel();

        let loops = self.loops.lock().take();
        if let Some(mut loops) = loops {
            while loops.join_next().await.is_some() {}
        }

        let stats = self.stats();
        tracing::info!(
            items_received = stats.items_received,
            items_flushed = stats.items_flushed,
            items_spilled = stats.items_spilled,
            flush_count = stats.flush_count,
            flush_errors = stats.flush_errors,
            "Batcher stopped"
        );
    }
}

impl Shared {
    async fn collect_loop(&self, mut input_rx: mpsc::Receiver<MetricData>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                metric = input_rx.recv() => {
                    let Some(metric) = metric else { break };
                    self.buffer.add(metric);
                    self.counters.items_received.fetch_add(1, Ordering::Relaxed);

                    if self.buffer.should_flush(self.cfg.max_size, self.cfg.max_memory_mb) {
                        tracing::debug!("Buffer threshold reached, flushing");
                        self.flush().await;
                    }
                }
            }
        }

        // Drain whatever the producers managed to enqueue, then flush once
        // more so shutdown never strands buffered data.
        while let Ok(metric) = input_rx.try_recv() {
            self.buffer.add(metric);
            self.counters.items_received.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!("Collect loop stopping, performing final flush");
        self.flush().await;
    }

    async fn timer_loop(&self) {
        let mut tick = interval(Duration::from_secs(self.cfg.interval.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => self.flush().await,
            }
        }
    }

    async fn flush(&self) {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }

        let started = Instant::now();
        match self.flusher.flush(&batch).await {
            Ok(()) => {
                self.counters
                    .items_flushed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.counters.flush_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    size = batch.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flush successful"
                );
            }
            Err(e) => {
                self.counters.flush_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(size = batch.len(), error = %e, "Flush failed, spilling batch");
                match self.spill.spill(&batch).await {
                    Ok(()) => {
                        self.counters
                            .items_spilled
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters
                            .items_lost
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        tracing::error!(size = batch.len(), error = %e, "Spill failed, batch lost");
                    }
                }
            }
        }
    }
}
