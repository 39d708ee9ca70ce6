use crate::config::Config;
use fieldmon_batch::{Batcher, BatcherStats, Flusher};
use fieldmon_cache::SpillCache;
use fieldmon_common::{Device, MetricData, ProtocolKind};
use fieldmon_engine::{
    BreakerRegistry, Scheduler, TaskError, WorkerPool, WorkerPoolConfig, WorkerPoolStats,
};
use fieldmon_protocol::sim::SimSessionFactory;
use fieldmon_protocol::{Protocol, SessionFactory, SessionProtocol};
use fieldmon_receiver::{PushHandler, ReceiverManager};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const STATS_PERIOD: Duration = Duration::from_secs(10);

/// Owns the component instances and the fan-in tasks between them.
///
/// Start order: protocols and the sink are built first, then the spill
/// cache, batcher, worker pool, scheduler (seeded with the devices), the
/// fan-in loops and finally the receiver. `stop` cancels the shared token
/// once and unwinds in reverse; the batcher flushes what is left and a hung
/// sink results in a spilled batch rather than silent loss.
pub struct Agent {
    config: Config,
    devices: Vec<Arc<Device>>,
    protocols: Arc<HashMap<ProtocolKind, Arc<dyn Protocol>>>,
    breakers: Arc<BreakerRegistry>,
    worker_pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    batcher: Arc<Batcher>,
    cache: Arc<SpillCache>,
    sink: Arc<dyn Flusher>,
    receiver: ReceiverManager,
    cancel: CancellationToken,
    started_at: Instant,
    collect_errors: Arc<AtomicU64>,
    scheduler_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    fan_in: parking_lot::Mutex<Option<JoinSet<()>>>,
    aux: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl Agent {
    pub fn new(config: Config, devices: Vec<Arc<Device>>) -> anyhow::Result<Self> {
        let sink = fieldmon_sink::build(&config.sink)?;
        Self::with_sink(config, devices, sink)
    }

    /// Builds the agent around an explicit sink; `new` resolves one from
    /// configuration.
    pub fn with_sink(
        config: Config,
        devices: Vec<Arc<Device>>,
        sink: Arc<dyn Flusher>,
    ) -> anyhow::Result<Self> {
        if let Some(percent) = config.agent.gc_percent {
            tracing::debug!(gc_percent = percent, "agent.gc_percent has no effect");
        }

        let cancel = CancellationToken::new();
        let protocols = Arc::new(build_protocols(&config, &devices)?);
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.clone()));
        let cache = Arc::new(SpillCache::open(&config.cache)?);
        let batcher = Arc::new(Batcher::new(
            config.batch.clone(),
            sink.clone(),
            cache.clone(),
        ));

        let worker_pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                worker_count: config.agent.max_concurrency,
                queue_size: config.agent.max_devices * 2,
            },
            protocols.clone(),
            breakers.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            worker_pool.clone(),
            Duration::from_secs(config.agent.collection_interval),
            cancel.child_token(),
        ));

        let push_batcher = batcher.clone();
        let handler: PushHandler = Arc::new(move |data: MetricData| {
            push_batcher.add(data);
            Ok(())
        });
        let receiver = ReceiverManager::new(&config.receiver, handler, cancel.child_token());

        tracing::info!(
            agent_id = %config.agent.id,
            devices = devices.len(),
            worker_pool_size = config.agent.max_concurrency,
            collection_interval_secs = config.agent.collection_interval,
            sink = sink.name(),
            "Components initialized"
        );

        Ok(Self {
            config,
            devices,
            protocols,
            breakers,
            worker_pool,
            scheduler,
            batcher,
            cache,
            sink,
            receiver,
            cancel,
            started_at: Instant::now(),
            collect_errors: Arc::new(AtomicU64::new(0)),
            scheduler_task: parking_lot::Mutex::new(None),
            fan_in: parking_lot::Mutex::new(None),
            aux: parking_lot::Mutex::new(None),
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(agent_id = %self.config.agent.id, "Starting agent");

        self.batcher.start();

        let result_rx = self.worker_pool.take_results();
        let error_rx = self.worker_pool.take_errors();
        self.worker_pool.start();

        for device in &self.devices {
            self.scheduler.add_device(device.clone());
        }
        let scheduler = self.scheduler.clone();
        *self.scheduler_task.lock() = Some(tokio::spawn(async move { scheduler.run().await }));

        let mut fan_in = JoinSet::new();
        if let Some(rx) = result_rx {
            let batcher = self.batcher.clone();
            fan_in.spawn(process_results(rx, batcher));
        }
        if let Some(rx) = error_rx {
            let errors = self.collect_errors.clone();
            fan_in.spawn(process_errors(rx, errors));
        }
        *self.fan_in.lock() = Some(fan_in);

        let mut aux = JoinSet::new();
        aux.spawn(
            StatsLoop {
                worker_pool: self.worker_pool.clone(),
                batcher: self.batcher.clone(),
                scheduler: self.scheduler.clone(),
                breakers: self.breakers.clone(),
                cache: self.cache.clone(),
                collect_errors: self.collect_errors.clone(),
                device_count: self.devices.len(),
                started_at: self.started_at,
                cancel: self.cancel.child_token(),
            }
            .run(),
        );
        aux.spawn(
            RetryLoop {
                cache: self.cache.clone(),
                sink: self.sink.clone(),
                period: Duration::from_secs(self.config.cache.retry_interval.max(1)),
                cancel: self.cancel.child_token(),
            }
            .run(),
        );
        let gc_cache = self.cache.clone();
        let gc_period = Duration::from_secs(self.config.cache.gc_interval);
        let gc_cancel = self.cancel.child_token();
        aux.spawn(async move { gc_cache.run_gc(gc_period, gc_cancel).await });
        *self.aux.lock() = Some(aux);

        self.receiver.start().await?;

        tracing::info!(
            scheduled_tasks = self.scheduler.task_count(),
            receivers = self.receiver.active_count(),
            "Agent started"
        );
        Ok(())
    }

    /// Graceful shutdown: one cancellation, then unwind. The worker pool
    /// drains before the fan-in loops are joined (their channels close when
    /// the last worker exits), and the batcher flushes last so every
    /// in-flight result is either delivered or spilled.
    pub async fn stop(&self) {
        tracing::info!("Stopping agent");
        self.cancel.cancel();

        self.receiver.stop().await;

        let scheduler_task = self.scheduler_task.lock().take();
        if let Some(task) = scheduler_task {
            let _ = task.await;
        }

        self.worker_pool.stop().await;

        let fan_in = self.fan_in.lock().take();
        if let Some(mut fan_in) = fan_in {
            while fan_in.join_next().await.is_some() {}
        }

        self.batcher.stop().await;

        let aux = self.aux.lock().take();
        if let Some(mut aux) = aux {
            while aux.join_next().await.is_some() {}
        }

        for (kind, protocol) in self.protocols.iter() {
            tracing::info!(protocol = %kind, "Closing protocol");
            if let Err(e) = protocol.close().await {
                tracing::error!(protocol = %kind, error = %e, "Error closing protocol");
            }
        }

        if let Err(e) = self.sink.close().await {
            tracing::error!(error = %e, "Error closing sink");
        }
        self.cache.close();

        tracing::info!("Agent stopped");
    }

    pub fn worker_stats(&self) -> WorkerPoolStats {
        self.worker_pool.stats()
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.batcher.stats()
    }

    pub fn spill_size(&self) -> u64 {
        self.cache.size().unwrap_or(0)
    }

    pub fn collect_error_count(&self) -> u64 {
        self.collect_errors.load(Ordering::Relaxed)
    }
}

fn build_protocols(
    config: &Config,
    devices: &[Arc<Device>],
) -> anyhow::Result<HashMap<ProtocolKind, Arc<dyn Protocol>>> {
    let kinds: HashSet<ProtocolKind> = devices.iter().map(|d| d.protocol).collect();

    let mut protocols: HashMap<ProtocolKind, Arc<dyn Protocol>> = HashMap::new();
    for kind in kinds {
        let factory = session_factory(kind)?;
        let pool_cfg = config
            .connection_pool
            .get(kind.as_str())
            .cloned()
            .unwrap_or_default();
        protocols.insert(kind, Arc::new(SessionProtocol::new(kind, &pool_cfg, factory)));
    }

    tracing::info!(protocol_count = protocols.len(), "Protocols initialized");
    Ok(protocols)
}

fn session_factory(kind: ProtocolKind) -> anyhow::Result<Arc<dyn SessionFactory>> {
    match kind {
        ProtocolKind::Sim => Ok(Arc::new(SimSessionFactory)),
        other => anyhow::bail!("no session factory registered for protocol '{other}'"),
    }
}

async fn process_results(mut rx: mpsc::Receiver<MetricData>, batcher: Arc<Batcher>) {
    while let Some(data) = rx.recv().await {
        batcher.add(data);
    }
    tracing::debug!("Result fan-in finished");
}

async fn process_errors(mut rx: mpsc::Receiver<TaskError>, errors: Arc<AtomicU64>) {
    while let Some(task_error) = rx.recv().await {
        if task_error.error.is_device_failure() {
            errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                device_id = %task_error.task.device_id,
                error = %task_error.error,
                "Collection error"
            );
        }
    }
    tracing::debug!("Error fan-in finished");
}

/// Periodic structured snapshot of the engine's counters.
struct StatsLoop {
    worker_pool: Arc<WorkerPool>,
    batcher: Arc<Batcher>,
    scheduler: Arc<Scheduler>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<SpillCache>,
    collect_errors: Arc<AtomicU64>,
    device_count: usize,
    started_at: Instant,
    cancel: CancellationToken,
}

impl StatsLoop {
    async fn run(self) {
        let mut tick = interval(STATS_PERIOD);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let worker = self.worker_pool.stats();
                    let batcher = self.batcher.stats();
                    tracing::debug!(
                        uptime_secs = self.started_at.elapsed().as_secs(),
                        devices = self.device_count,
                        scheduled_tasks = self.scheduler.task_count(),
                        active_workers = worker.active_workers,
                        queued_tasks = worker.queued_tasks,
                        tasks_completed = worker.tasks_completed,
                        tasks_failed = worker.tasks_failed,
                        buffer_size = batcher.buffer_size,
                        items_flushed = batcher.items_flushed,
                        items_spilled = batcher.items_spilled,
                        open_breakers = self.breakers.open_count(),
                        collect_errors = self.collect_errors.load(Ordering::Relaxed),
                        spill_entries = self.cache.size().unwrap_or(0),
                        "Agent stats"
                    );
                }
            }
        }
    }
}

/// Drains the spill cache through the sink on a fixed period, deleting
/// entries as they land. A pass stops at the first delivery failure; the
/// next tick starts over from the oldest entry.
struct RetryLoop {
    cache: Arc<SpillCache>,
    sink: Arc<dyn Flusher>,
    period: Duration,
    cancel: CancellationToken,
}

impl RetryLoop {
    async fn run(self) {
        let mut tick = interval(self.period);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => self.drain_spill().await,
            }
        }
    }

    async fn drain_spill(&self) {
        let entries = match self.cache.get_all() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read spill cache");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        tracing::info!(count = entries.len(), "Retrying spilled metrics");
        let mut delivered = 0usize;
        for (key, metric) in entries {
            match self.sink.flush(std::slice::from_ref(&metric)).await {
                Ok(()) => {
                    if let Err(e) = self.cache.delete(&key) {
                        tracing::warn!(key = %key, error = %e, "Failed to delete spill entry");
                    }
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, delivered, "Sink still failing, stopping retry pass");
                    return;
                }
            }
        }
        tracing::info!(delivered, "Spill cache drained");
    }
}
